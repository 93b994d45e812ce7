//! AMP ICMP latency collection

use lazy_static::lazy_static;
use regex::Regex;

use super::adapter::{CollectionAdapter, DetailColumns};
use crate::error::CollectionError;
use crate::index::StreamIndex;
use crate::source::StreamRecord;
use crate::types::{Label, Properties, PropertyValue, Timestamp};

lazy_static! {
    /// `FROM <source> TO <destination> OPTION <size> <split>`
    static ref GROUP_RE: Regex = Regex::new(concat!(
        r"FROM (?P<source>[.a-zA-Z0-9-]+) ",
        r"TO (?P<destination>[.a-zA-Z0-9-]+) ",
        r"OPTION (?P<option>[a-zA-Z0-9]+) ",
        r"(?P<split>[A-Z0-9]+)",
    ))
    .expect("group description pattern is valid");
}

/// Bins narrower than this many seconds are never useful for ICMP
const NATIVE_BINSIZE: i64 = 60;

/// How a group splits its streams into lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// One line per address family
    Family,
    /// One line across every address
    Full,
    /// IPv4 streams only
    Ipv4,
    /// IPv6 streams only
    Ipv6,
}

impl Split {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "FAMILY" => Some(Self::Family),
            "FULL" => Some(Self::Full),
            "IPV4" => Some(Self::Ipv4),
            "IPV6" => Some(Self::Ipv6),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Family => "FAMILY",
            Self::Full => "FULL",
            Self::Ipv4 => "IPV4",
            Self::Ipv6 => "IPV6",
        }
    }
}

/// A parsed ICMP group description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpGroup {
    /// Measuring AMP monitor
    pub source: String,
    /// Target host
    pub destination: String,
    /// Probe size option
    pub packet_size: String,
    /// Line split
    pub split: Split,
}

impl IcmpGroup {
    /// Parse `FROM <src> TO <dst> OPTION <size> <split>`
    pub fn parse(description: &str) -> Result<Self, CollectionError> {
        let invalid = || CollectionError::InvalidGroup(description.to_string());
        let caps = GROUP_RE.captures(description).ok_or_else(invalid)?;

        let split = Split::parse(&caps["split"]).ok_or_else(invalid)?;
        Ok(Self {
            source: caps["source"].to_string(),
            destination: caps["destination"].to_string(),
            packet_size: caps["option"].to_string(),
            split,
        })
    }

    /// Canonical description string
    pub fn description(&self) -> String {
        format!(
            "FROM {} TO {} OPTION {} {}",
            self.source,
            self.destination,
            self.packet_size,
            self.split.as_str()
        )
    }

    fn search(&self) -> Properties {
        let mut search = Properties::new();
        search.insert("source".into(), PropertyValue::from(self.source.as_str()));
        search.insert("destination".into(), PropertyValue::from(self.destination.as_str()));
        search.insert(
            "packet_size".into(),
            PropertyValue::from(self.packet_size.as_str()),
        );
        search
    }
}

/// Adapter for the `amp-icmp` collection
#[derive(Debug, Default, Clone)]
pub struct AmpIcmp;

impl AmpIcmp {
    fn label(
        base: &str,
        search: &Properties,
        family: Option<&str>,
        index: &StreamIndex,
    ) -> Label {
        let mut search = search.clone();
        let (key, short) = match family {
            Some(family) => {
                search.insert("family".into(), PropertyValue::from(family.to_lowercase()));
                (format!("{}_{}", base, family), family.to_string())
            },
            None => (base.to_string(), "All addresses".to_string()),
        };
        let mut streams = index.find_stream_ids(&search);
        streams.sort_unstable();
        Label::new(key, streams, short)
    }
}

impl CollectionAdapter for AmpIcmp {
    fn name(&self) -> &str {
        "amp-icmp"
    }

    fn stream_properties(&self) -> Vec<String> {
        ["source", "destination", "packet_size", "family"]
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    fn detail_columns(&self, detail: &str) -> Option<DetailColumns> {
        let columns = match detail {
            // Matrix cells need the latency spread as well as the mean
            "matrix" => DetailColumns::new(
                &["median", "median", "median", "loss", "results", "lossrate"],
                &["avg", "stddev", "count", "sum", "sum", "stddev"],
            ),
            "basic" | "spark" | "tooltiptext" => {
                DetailColumns::new(&["median", "loss", "results"], &["avg", "sum", "sum"])
            },
            _ => DetailColumns::new(
                &["median", "rtts", "loss", "results"],
                &["avg", "smokearray", "sum", "sum"],
            ),
        };
        Some(columns)
    }

    fn group_to_labels(
        &self,
        group_id: i64,
        description: &str,
        index: &StreamIndex,
    ) -> Result<Vec<Label>, CollectionError> {
        let group = IcmpGroup::parse(description)?;
        let base = format!("group_{}", group_id);
        let search = group.search();

        let mut labels = Vec::new();
        if matches!(group.split, Split::Ipv4 | Split::Family) {
            labels.push(Self::label(&base, &search, Some("IPv4"), index));
        }
        if matches!(group.split, Split::Ipv6 | Split::Family) {
            labels.push(Self::label(&base, &search, Some("IPv6"), index));
        }
        if group.split == Split::Full {
            labels.push(Self::label(&base, &search, None, index));
        }

        labels.sort_by(|a, b| a.short_label.cmp(&b.short_label));
        Ok(labels)
    }

    fn prepare_stream(&self, record: &StreamRecord) -> (Properties, Option<serde_json::Value>) {
        let mut properties = record.index_properties();
        let address = record
            .properties
            .get("address")
            .and_then(|a| a.as_str())
            .map(str::to_string);

        if let Some(address) = &address {
            if !properties.contains_key("family") {
                let family = if address.contains('.') { "ipv4" } else { "ipv6" };
                properties.insert("family".into(), PropertyValue::from(family));
            }
        }

        let payload = address.map(|address| serde_json::json!({ "address": address }));
        (properties, payload)
    }

    fn calculate_binsize(
        &self,
        start: Timestamp,
        end: Timestamp,
        _detail: &str,
        target_points: i64,
    ) -> i64 {
        if (end - start) / NATIVE_BINSIZE < target_points {
            return NATIVE_BINSIZE;
        }
        crate::reconcile::auto_binsize(start, end, target_points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(source: &str, dest: &str, size: &str, family: &str) -> Properties {
        let mut p = Properties::new();
        p.insert("source".into(), PropertyValue::from(source));
        p.insert("destination".into(), PropertyValue::from(dest));
        p.insert("packet_size".into(), PropertyValue::from(size));
        p.insert("family".into(), PropertyValue::from(family));
        p
    }

    fn index() -> StreamIndex {
        let mut index = StreamIndex::new(AmpIcmp.stream_properties());
        index.add_stream(1, None, &props("a", "b", "84", "ipv4")).unwrap();
        index.add_stream(2, None, &props("a", "b", "84", "ipv6")).unwrap();
        index.add_stream(3, None, &props("a", "b", "84", "ipv4")).unwrap();
        index.add_stream(4, None, &props("a", "c", "84", "ipv4")).unwrap();
        index
    }

    #[test]
    fn test_group_pattern_compiles() {
        lazy_static::initialize(&GROUP_RE);
        assert!(GROUP_RE.is_match("FROM a TO b OPTION 84 FULL"));
    }

    #[test]
    fn test_parse_group() {
        let group = IcmpGroup::parse("FROM amp-a TO www.example.com OPTION 84 FAMILY").unwrap();
        assert_eq!(group.source, "amp-a");
        assert_eq!(group.destination, "www.example.com");
        assert_eq!(group.packet_size, "84");
        assert_eq!(group.split, Split::Family);
        assert_eq!(group.description(), "FROM amp-a TO www.example.com OPTION 84 FAMILY");
    }

    #[test]
    fn test_parse_group_rejects_unknown_split() {
        assert!(matches!(
            IcmpGroup::parse("FROM a TO b OPTION 84 NONE"),
            Err(CollectionError::InvalidGroup(_))
        ));
        assert!(IcmpGroup::parse("garbage").is_err());
    }

    #[test]
    fn test_family_split_labels() {
        let labels = AmpIcmp
            .group_to_labels(7, "FROM a TO b OPTION 84 FAMILY", &index())
            .unwrap();

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].label, "group_7_IPv4");
        assert_eq!(labels[0].short_label, "IPv4");
        assert_eq!(labels[0].streams, vec![1, 3]);
        assert_eq!(labels[1].label, "group_7_IPv6");
        assert_eq!(labels[1].streams, vec![2]);
    }

    #[test]
    fn test_full_split_label() {
        let labels = AmpIcmp
            .group_to_labels(7, "FROM a TO b OPTION 84 FULL", &index())
            .unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, "group_7");
        assert_eq!(labels[0].short_label, "All addresses");
        assert_eq!(labels[0].streams, vec![1, 2, 3]);
    }

    #[test]
    fn test_prepare_stream_derives_family() {
        let record: StreamRecord = serde_json::from_value(json!({
            "stream_id": 9,
            "source": "a",
            "destination": "b",
            "packet_size": "84",
            "address": "2001:db8::1"
        }))
        .unwrap();

        let (properties, payload) = AmpIcmp.prepare_stream(&record);
        assert_eq!(properties.get("family"), Some(&PropertyValue::from("ipv6")));
        assert_eq!(payload, Some(json!({"address": "2001:db8::1"})));
    }

    #[test]
    fn test_detail_columns() {
        let matrix = AmpIcmp.detail_columns("matrix").unwrap();
        assert_eq!(matrix.columns.len(), matrix.aggregators.len());
        assert_eq!(matrix.aggregators[1], "stddev");

        let full = AmpIcmp.detail_columns("full").unwrap();
        assert!(full.aggregators.contains(&"smokearray".to_string()));
    }

    #[test]
    fn test_binsize_floor() {
        assert_eq!(AmpIcmp.calculate_binsize(0, 3600, "full", 200), 60);
        assert_eq!(AmpIcmp.calculate_binsize(0, 86400, "full", 200), 600);
    }

    #[test]
    fn test_extra_blocks() {
        assert_eq!(AmpIcmp.extra_blocks("full", 2), 2);
        assert_eq!(AmpIcmp.extra_blocks("matrix", 2), 0);
    }
}
