/*
 Copyright (c) 2025 clone206

 This file is part of pdmdecim

 pdmdecim is free software: you can redistribute it and/or modify it
 under the terms of the GNU General Public License as published by the
 Free Software Foundation, either version 3 of the License, or
 (at your option) any later version.

 pdmdecim is distributed in the hope that it will be useful, but
 WITHOUT ANY WARRANTY; without even the implied warranty of
 MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 GNU General Public License for more details.
 You should have received a copy of the GNU General Public License
 along with pdmdecim. If not, see <https://www.gnu.org/licenses/>.
*/


// C header emission for the embedded decimator: per-stage #defines and
// coefficient arrays. Stage 1 is written as its packed bit-plane words.

use std::io::Write;

use crate::chain::FilterChain;
use crate::model::{DecimResult, invalid};
use crate::stage1::Stage1Filter;
use crate::stage2::Stage2Filter;

const STAGE1_WORDS_PER_ROW: usize = 8;
const FIR_COEFS_PER_ROW: usize = 4;

// Python-style hex: sign first, lowercase digits.
fn hex(c: i32) -> String {
    if c < 0 {
        format!("-{:#x}", c.unsigned_abs())
    } else {
        format!("{:#x}", c)
    }
}

fn write_defines<W: Write>(
    out: &mut W,
    prefix: &str,
    stage: usize,
    q: usize,
    taps: usize,
    shr: &str,
) -> DecimResult<()> {
    let p = prefix.to_uppercase();
    writeln!(out)?;
    writeln!(out, "#define {}_STG{}_DECIMATION_FACTOR   {}", p, stage, q)?;
    writeln!(out, "#define {}_STG{}_TAP_COUNT           {}", p, stage, taps)?;
    writeln!(out, "#define {}_STG{}_SHR                 {}", p, stage, shr)?;
    writeln!(out)?;
    Ok(())
}

fn write_stage1<W: Write>(out: &mut W, prefix: &str, s1: &Stage1Filter) -> DecimResult<()> {
    write_defines(
        out,
        prefix,
        1,
        s1.decimation_factor(),
        s1.tap_count(),
        "0 /*shr not relevant for stage 1*/",
    )?;
    let words = s1.to_packed_array();
    writeln!(out, "uint32_t {}_stg1_coef[{}] = {{", prefix, words.len())?;
    for row in words.chunks(STAGE1_WORDS_PER_ROW) {
        let row: Vec<String> = row.iter().map(|w| format!("0x{:08X}", w)).collect();
        writeln!(out, "  {},", row.join(", "))?;
    }
    writeln!(out, "}};")?;
    Ok(())
}

fn write_fir<W: Write>(out: &mut W, prefix: &str, stage: usize, s: &Stage2Filter) -> DecimResult<()> {
    write_defines(
        out,
        prefix,
        stage,
        s.decimation_factor(),
        s.tap_count(),
        &s.shr().to_string(),
    )?;
    writeln!(out, "int32_t {}_stg{}_coef[{}] = {{", prefix, stage, s.tap_count())?;
    let full = s.coefs().len() / FIR_COEFS_PER_ROW * FIR_COEFS_PER_ROW;
    let (rows, rest) = s.coefs().split_at(full);
    for row in rows.chunks(FIR_COEFS_PER_ROW) {
        let row: Vec<String> = row.iter().map(|&c| hex(c)).collect();
        writeln!(out, "{},", row.join(", "))?;
    }
    if !rest.is_empty() {
        let rest: Vec<String> = rest.iter().map(|&c| hex(c)).collect();
        writeln!(out, "{}", rest.join(", "))?;
    }
    writeln!(out, "}};")?;
    Ok(())
}

/// Write a self-contained header for `chain`, with names derived from
/// `prefix` (which must be a valid C identifier).
pub fn write_header<W: Write>(chain: &FilterChain, prefix: &str, out: &mut W) -> DecimResult<()> {
    let valid = prefix
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return invalid(format!("header prefix {:?} is not a C identifier", prefix));
    }
    let guard = format!("{}_H_", prefix.to_uppercase());
    writeln!(out, "// Generated by pdmdecim. Do not edit.")?;
    writeln!(out, "#ifndef {}", guard)?;
    writeln!(out, "#define {}", guard)?;
    writeln!(out)?;
    writeln!(out, "#include <stdint.h>")?;

    write_stage1(out, prefix, chain.stage1())?;
    write_fir(out, prefix, 2, chain.stage2())?;
    if let Some(s3) = chain.stage3() {
        write_fir(out, prefix, 3, s3)?;
    }

    writeln!(out)?;
    writeln!(out, "#endif // {}", guard)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(s2: Vec<i32>) -> FilterChain {
        let mut c1 = vec![0i16; 256];
        c1[255] = 32766;
        FilterChain::two_stage(
            Stage1Filter::new(c1, 32).unwrap(),
            Stage2Filter::new(s2, 2).unwrap(),
        )
    }

    fn render(chain: &FilterChain) -> String {
        let mut out = Vec::new();
        write_header(chain, "custom_filt", &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn hex_matches_python_style() {
        assert_eq!(hex(255), "0xff");
        assert_eq!(hex(-255), "-0xff");
        assert_eq!(hex(i32::MIN), "-0x80000000");
    }

    #[test]
    fn defines_and_guards() {
        let text = render(&chain(vec![1 << 30, i32::MAX, 1 << 30]));
        assert!(text.contains("#ifndef CUSTOM_FILT_H_\n#define CUSTOM_FILT_H_\n"));
        assert!(text.contains("#define CUSTOM_FILT_STG1_DECIMATION_FACTOR   32\n"));
        assert!(text.contains("#define CUSTOM_FILT_STG1_TAP_COUNT           256\n"));
        assert!(text.contains("#define CUSTOM_FILT_STG1_SHR                 0 /*shr not relevant for stage 1*/\n"));
        assert!(text.contains("#define CUSTOM_FILT_STG2_TAP_COUNT           3\n"));
        assert!(!text.contains("STG3"));
        assert!(text.trim_end().ends_with("#endif // CUSTOM_FILT_H_"));
    }

    #[test]
    fn stage1_words_eight_per_row() {
        let ch = chain(vec![i32::MAX]);
        let text = render(&ch);
        let words = ch.stage1().to_packed_array();
        assert!(text.contains(&format!("uint32_t custom_filt_stg1_coef[{}] = {{\n", words.len())));
        let rows: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("  0x"))
            .collect();
        assert_eq!(rows.len(), words.len() / 8);
        let first: Vec<String> = words[..8].iter().map(|w| format!("0x{:08X}", w)).collect();
        assert_eq!(rows[0], format!("  {},", first.join(", ")));
    }

    #[test]
    fn fir_short_row_is_flushed_without_comma() {
        let coefs = vec![1, -2, 3, 4, i32::MAX, 6];
        let text = render(&chain(coefs));
        let body = text
            .split("int32_t custom_filt_stg2_coef[6] = {\n")
            .nth(1)
            .unwrap();
        assert!(body.starts_with("0x1, -0x2, 0x3, 0x4,\n0x7fffffff, 0x6\n};\n"));
    }

    #[test]
    fn prefix_must_be_identifier() {
        let ch = chain(vec![i32::MAX]);
        let mut out = Vec::new();
        assert!(write_header(&ch, "9bad", &mut out).is_err());
        assert!(write_header(&ch, "bad-name", &mut out).is_err());
        assert!(write_header(&ch, "", &mut out).is_err());
    }
}
