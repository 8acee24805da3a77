//! Module to handle AS paths in the textual form printed by route collectors, e.g.,
//! `"3356 1299 {64512,64513}"`.

use itertools::Itertools;

/// Autonomous system number (4-byte).
pub type Asn = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AsPathError {
    #[error("Invalid AS number `{asn}` in AS path `{path}`")]
    InvalidAsn { asn: String, path: String },
    #[error("Unterminated AS_SET in AS path `{0}`")]
    UnterminatedSet(String),
    #[error("Empty AS_SET in AS path `{0}`")]
    EmptySet(String),
}

/// Parse an AS path given as whitespace-separated AS numbers. An `AS_SET` segment (`{a,b,c}`)
/// is reduced to its first AS number, which is how the collectors feeding this project flatten
/// aggregated routes. A leading `AS` on a number is accepted.
pub fn parse_as_path(path: &str) -> Result<Vec<Asn>, AsPathError> {
    let mut asns = Vec::new();
    let mut rest = path.trim();

    while !rest.is_empty() {
        if let Some(set) = rest.strip_prefix('{') {
            let Some(end) = set.find('}') else {
                return Err(AsPathError::UnterminatedSet(path.to_string()));
            };
            let Some(first) = set[..end]
                .split(|c: char| c == ',' || c.is_whitespace())
                .find(|x| !x.is_empty())
            else {
                return Err(AsPathError::EmptySet(path.to_string()));
            };
            asns.push(parse_asn(first, path)?);
            rest = set[end + 1..].trim_start();
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '{')
                .unwrap_or(rest.len());
            asns.push(parse_asn(&rest[..end], path)?);
            rest = rest[end..].trim_start();
        }
    }

    Ok(asns)
}

fn parse_asn(token: &str, path: &str) -> Result<Asn, AsPathError> {
    let digits = token
        .strip_prefix("AS")
        .or_else(|| token.strip_prefix("as"))
        .unwrap_or(token);
    digits.parse().map_err(|_| AsPathError::InvalidAsn {
        asn: token.to_string(),
        path: path.to_string(),
    })
}

/// Format an AS path as whitespace-separated AS numbers.
pub fn format_as_path(path: &[Asn]) -> String {
    path.iter().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parsing() {
        assert_eq!(parse_as_path("100 200 300"), Ok(vec![100, 200, 300]));
        assert_eq!(parse_as_path("  AS100   200 "), Ok(vec![100, 200]));
        assert_eq!(parse_as_path(""), Ok(vec![]));
        assert_eq!(parse_as_path("100 {300,400}"), Ok(vec![100, 300]));
        assert_eq!(parse_as_path("100{ 300 }200"), Ok(vec![100, 300, 200]));
        assert_eq!(parse_as_path("100 {300 400} 500"), Ok(vec![100, 300, 500]));
    }

    #[test]
    fn parsing_errors() {
        assert!(matches!(
            parse_as_path("100 abc"),
            Err(AsPathError::InvalidAsn { .. })
        ));
        assert!(matches!(
            parse_as_path("100 {300"),
            Err(AsPathError::UnterminatedSet(_))
        ));
        assert!(matches!(
            parse_as_path("100 {,}"),
            Err(AsPathError::EmptySet(_))
        ));
        assert!(parse_as_path("100 4294967296").is_err());
    }

    #[test]
    fn formatting() {
        assert_eq!(format_as_path(&[100, 200, 300]), "100 200 300");
        assert_eq!(format_as_path(&[]), "");
    }
}
