use std::path::Path;

use crate::Map;

/// Parse a line-oriented `Key=Value` configuration file.
///
/// `#` starts a comment, blank lines are skipped and keys are
/// case-insensitive (returned lowercased). Values may be double-quoted.
/// Schema validation is left to the caller.
pub fn parse_conf(content: &str) -> anyhow::Result<Map<String, String>> {
    let mut options = Map::new();
    for (index, raw) in content.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("line {}: expected Key=Value, got '{line}'", index + 1))?;
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            anyhow::bail!("line {}: missing key", index + 1);
        }
        let mut value = value.trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        if options.insert(key, value.to_string()).is_some() {
            anyhow::bail!("line {}: duplicate key", index + 1);
        }
    }
    Ok(options)
}

pub fn read_conf(path: &Path) -> anyhow::Result<Map<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|error| anyhow::anyhow!("cannot read {}: {error}", path.display()))?;
    parse_conf(&content).map_err(|error| anyhow::anyhow!("{}: {error}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::parse_conf;

    #[test]
    fn test_parse_basic() {
        let options = parse_conf("Granularity=1G\nAllowUsers=alice:bob\n").unwrap();
        assert_eq!(options["granularity"], "1G");
        assert_eq!(options["allowusers"], "alice:bob");
    }

    #[test]
    fn test_parse_comments_and_blank_lines() {
        let options = parse_conf("# header\n\nGres=nodes:16 # trailing\n").unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options["gres"], "nodes:16");
    }

    #[test]
    fn test_parse_quoted_value() {
        let options = parse_conf("GetSysState=\"/usr/sbin/bbpools\"\n").unwrap();
        assert_eq!(options["getsysstate"], "/usr/sbin/bbpools");
    }

    #[test]
    fn test_parse_missing_separator() {
        assert!(parse_conf("JustAKey\n").is_err());
    }

    #[test]
    fn test_parse_duplicate_key() {
        assert!(parse_conf("Granularity=1\ngranularity=2\n").is_err());
    }
}
