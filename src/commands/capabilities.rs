use std::io::Write;

use anyhow::Result;

use crate::refs::CAPABILITIES;

/// Handle the capabilities command
/// Output one supported capability per line, then an empty line
pub fn handle<W: Write>(output: &mut W) -> Result<()> {
    for capability in CAPABILITIES {
        writeln!(output, "{}", capability)?;
    }
    writeln!(output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_push_capabilities() {
        let mut out = Vec::new();
        handle(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "ofs-delta\ndelete-refs\nreport-status\n\n"
        );
    }
}
