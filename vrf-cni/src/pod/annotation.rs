use ipnetwork::IpNetwork;

use crate::{Error, Result};

/// Parses the allowed-spoofing annotation of a pod.
///
/// Accepts a JSON list (`["10.2.0.0/16", "fd00::/64"]`) or a plain comma
/// separated list. An empty annotation allows nothing.
pub fn parse_spoof_prefixes(annotation: &str) -> Result<Vec<IpNetwork>> {
    let annotation = annotation.trim();
    if annotation.is_empty() {
        return Ok(Vec::new());
    }
    let items: Vec<String> = if annotation.starts_with('[') {
        serde_json::from_str(annotation)
            .map_err(|e| Error::InvalidAnnotation(format!("{annotation}: {e}")))?
    } else {
        annotation.split(',').map(|s| s.trim().to_string()).collect()
    };
    items
        .iter()
        .map(|item| {
            item.parse::<IpNetwork>()
                .map_err(|e| Error::InvalidAnnotation(format!("{item}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_annotation_allows_nothing() {
        assert!(parse_spoof_prefixes("").unwrap().is_empty());
        assert!(parse_spoof_prefixes("  ").unwrap().is_empty());
    }

    #[test]
    fn json_and_comma_forms() {
        let json = parse_spoof_prefixes(r#"["10.2.0.0/16", "fd00::/64"]"#).unwrap();
        let csv = parse_spoof_prefixes("10.2.0.0/16, fd00::/64").unwrap();
        assert_eq!(json, csv);
        assert_eq!(json[0].to_string(), "10.2.0.0/16");
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let err = parse_spoof_prefixes("10.2.0.0/16,nope").unwrap_err();
        assert!(matches!(err, Error::InvalidAnnotation(_)));
        assert!(parse_spoof_prefixes("[10.2").is_err());
    }
}
