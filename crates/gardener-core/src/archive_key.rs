// SPDX-License-Identifier: Apache-2.0

//! Archive key grammar: `gs://{bucket}/{experiment}/{datatype}/{YYYY}/{MM}/
//! {DD}/{YYYYMMDD}T{HHMMSS}.{nanos}Z-{datatype}-{host}-{site}-{experiment}
//! .tgz` (and `.tar`, `.tar.gz` variants).
//!
//! `ArchiveDescriptor::key` holds the object-store key relative to its
//! bucket (no `gs://{bucket}` prefix — that part is tracked separately), so
//! parsing starts at the experiment path segment.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::errors::GardenerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveKey {
    pub experiment: String,
    pub datatype: String,
    pub date: NaiveDate,
    pub host: String,
    pub site: String,
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(?P<experiment_dir>[^/]+)/
            (?P<datatype_dir>[^/]+)/
            (?P<yyyy>\d{4})/(?P<mm>\d{2})/(?P<dd>\d{2})/
            (?P<yyyymmdd>\d{8})T(?P<hhmmss>\d{6})\.(?P<nanos>\d+)Z
            -(?P<datatype>[^-]+)
            -(?P<host>[^-]+)
            -(?P<site>[^-]+)
            -(?P<experiment>[^.]+)
            \.(?:tgz|tar\.gz|tar)$
            ",
        )
        .expect("archive key grammar is a valid regex")
    })
}

impl ArchiveKey {
    /// Parses an object-store key (bucket-relative) against the archive key
    /// grammar. Returns `InvalidInput` on any mismatch, including a
    /// directory/filename datatype disagreement or an unparsable date.
    pub fn parse(key: &str) -> Result<Self, GardenerError> {
        let caps = pattern()
            .captures(key)
            .ok_or_else(|| GardenerError::InvalidInput(format!("key does not match archive grammar: {key}")))?;

        let datatype_dir = &caps["datatype_dir"];
        let datatype = &caps["datatype"];
        if datatype_dir != datatype {
            return Err(GardenerError::InvalidInput(format!(
                "datatype mismatch between path ({datatype_dir}) and filename ({datatype}) in key: {key}"
            )));
        }

        let experiment_dir = &caps["experiment_dir"];
        let experiment = &caps["experiment"];
        if experiment_dir != experiment {
            return Err(GardenerError::InvalidInput(format!(
                "experiment mismatch between path ({experiment_dir}) and filename ({experiment}) in key: {key}"
            )));
        }

        let date = NaiveDate::parse_from_str(&caps["yyyymmdd"], "%Y%m%d")
            .map_err(|e| GardenerError::InvalidInput(format!("bad date in key {key}: {e}")))?;

        if date.format("%Y").to_string() != caps["yyyy"]
            || date.format("%m").to_string() != caps["mm"]
            || date.format("%d").to_string() != caps["dd"]
        {
            return Err(GardenerError::InvalidInput(format!(
                "date directory disagrees with filename timestamp in key: {key}"
            )));
        }

        Ok(ArchiveKey {
            experiment: experiment.to_string(),
            datatype: datatype.to_string(),
            date,
            host: caps["host"].to_string(),
            site: caps["site"].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_key() {
        let key = "ndt/ndt/2024/01/02/20240102T030405.123456789Z-ndt-mlab1-lga01-ndt.tgz";
        let parsed = ArchiveKey::parse(key).unwrap();
        assert_eq!(parsed.experiment, "ndt");
        assert_eq!(parsed.datatype, "ndt");
        assert_eq!(parsed.host, "mlab1");
        assert_eq!(parsed.site, "lga01");
        assert_eq!(parsed.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn rejects_datatype_mismatch() {
        let key = "ndt/ndt/2024/01/02/20240102T030405.123Z-other-mlab1-lga01-ndt.tgz";
        assert!(ArchiveKey::parse(key).is_err());
    }

    #[test]
    fn rejects_unstructured_key() {
        assert!(ArchiveKey::parse("not-an-archive-key").is_err());
    }

    #[test]
    fn accepts_tar_and_tar_gz_variants() {
        let base = "ndt/ndt/2024/01/02/20240102T030405.0Z-ndt-mlab1-lga01-ndt";
        assert!(ArchiveKey::parse(&format!("{base}.tar")).is_ok());
        assert!(ArchiveKey::parse(&format!("{base}.tar.gz")).is_ok());
    }
}
