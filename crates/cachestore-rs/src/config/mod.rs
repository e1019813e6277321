//! Volume and span configuration files.
//!
//! Both formats are line oriented: blank lines and `#` comments are
//! ignored, data lines carry whitespace-separated `key=value` tokens. Every
//! diagnostic is line qualified so a bad config reads like a compiler
//! error.


use std::path::{Path, PathBuf};

use crate::device::slurp;
use crate::errata::{Code, Errata, Severity};
use crate::layout::MAX_VOLUME_IDX;
use crate::units::{Bytes, Megabytes, StripeBlocks};

/// One volume record from the config file.
#[derive(Clone, Debug, Default)]
pub struct VolumeConfigData {
    /// Volume index, 1..=255.
    pub idx: u8,
    /// Size as a percent of total storage; 0 when given absolutely.
    pub percent: i64,
    /// Absolute size; zero when given as a percent.
    pub size: Megabytes,
    /// Allocation target, filled by [`VolumeConfig::convert_to_absolute`].
    pub alloc: StripeBlocks,
}

impl VolumeConfigData {
    fn has_size(&self) -> bool {
        self.percent > 0 || self.size.count() > 0
    }

    fn has_index(&self) -> bool {
        self.idx > 0
    }
}

/// Parsed volume-assignment rules.
#[derive(Clone, Debug, Default)]
pub struct VolumeConfig {
    volumes: Vec<VolumeConfigData>,
}

/// Megabytes per stripe block, for the rounding note.
const STRIPE_BLOCK_MB: i64 = StripeBlocks::SCALE / Megabytes::SCALE;

impl VolumeConfig {
    /// Load and parse a volume config file.
    pub fn load(path: &Path) -> (Option<Self>, Errata) {
        match slurp(path) {
            Ok(text) => {
                let (cfg, zret) = Self::parse(&text);
                (Some(cfg), zret)
            }
            Err(e) => (None, Errata::error(Code::Open, format!("{e:#}"))),
        }
    }

    /// Parse config text; records that parse survive even when other lines
    /// fail.
    pub fn parse(text: &str) -> (Self, Errata) {
        let mut zret = Errata::new();
        let mut cfg = Self::default();

        for (ln, line) in text.lines().enumerate() {
            let ln = ln + 1;
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut v = VolumeConfigData::default();
            for token in line.split_whitespace() {
                let Some((tag, value)) = token.split_once('=') else {
                    zret.push(
                        Severity::Error,
                        Code::ConfigParse,
                        format!("line {ln} is invalid: '{token}'"),
                    );
                    continue;
                };
                if tag.eq_ignore_ascii_case("size") {
                    if v.has_size() {
                        zret.push(
                            Severity::Error,
                            Code::ConfigParse,
                            format!("line {ln} has field 'size' more than once"),
                        );
                    } else if let Some(percent) = value.strip_suffix('%') {
                        match percent.parse::<i64>() {
                            Ok(n) if (1..=100).contains(&n) => v.percent = n,
                            _ => {
                                zret.push(
                                    Severity::Error,
                                    Code::InvalidValue,
                                    format!("line {ln} has invalid value '{value}' for 'size' field"),
                                );
                            }
                        }
                    } else {
                        match value.parse::<i64>() {
                            Ok(n) if n > 0 => {
                                v.size = Megabytes::new(n);
                                if n % STRIPE_BLOCK_MB != 0 {
                                    let rounded =
                                        StripeBlocks::round_up(v.size.to_bytes());
                                    zret.info(format!(
                                        "line {ln} size {n} MB will be rounded up to {rounded}"
                                    ));
                                }
                            }
                            _ => {
                                zret.push(
                                    Severity::Error,
                                    Code::InvalidValue,
                                    format!("line {ln} has invalid value '{value}' for 'size' field"),
                                );
                            }
                        }
                    }
                } else if tag.eq_ignore_ascii_case("volume") {
                    if v.has_index() {
                        zret.push(
                            Severity::Error,
                            Code::ConfigParse,
                            format!("line {ln} has field 'volume' more than once"),
                        );
                    } else {
                        match value.parse::<usize>() {
                            Ok(n) if (1..=MAX_VOLUME_IDX).contains(&n) => v.idx = n as u8,
                            _ => {
                                zret.push(
                                    Severity::Error,
                                    Code::InvalidValue,
                                    format!(
                                        "line {ln} has invalid value '{value}' for 'volume' field"
                                    ),
                                );
                            }
                        }
                    }
                }
                // Unknown tags are ignored, same as the runtime.
            }

            if v.has_size() && v.has_index() {
                cfg.volumes.push(v);
            } else {
                if !v.has_size() {
                    zret.push(
                        Severity::Error,
                        Code::ConfigParse,
                        format!("line {ln} does not have the required field 'size'"),
                    );
                }
                if !v.has_index() {
                    zret.push(
                        Severity::Error,
                        Code::ConfigParse,
                        format!("line {ln} does not have the required field 'volume'"),
                    );
                }
            }
        }
        (cfg, zret)
    }

    #[must_use]
    pub fn volumes(&self) -> &[VolumeConfigData] {
        &self.volumes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// Percent allocations must not sum above 100.
    pub fn validate_percent_allocation(&self) -> Errata {
        let mut zret = Errata::new();
        let n: i64 = self.volumes.iter().map(|v| v.percent).sum();
        if n > 100 {
            zret.push(
                Severity::Error,
                Code::PercentExceeds100,
                format!("volume percent allocation {n} is more than 100%"),
            );
        }
        zret
    }

    /// Fill each record's allocation target against the given total.
    /// Percent records take their ceiling share; absolute sizes round up to
    /// whole stripe blocks.
    pub fn convert_to_absolute(&mut self, total: StripeBlocks) {
        for v in &mut self.volumes {
            if v.percent > 0 {
                v.alloc = StripeBlocks::new((total.count() * v.percent + 99) / 100);
            } else {
                v.alloc = StripeBlocks::round_up(Bytes::new(v.size.units()));
            }
        }
    }
}

/// One line of a span config file: a path plus optional hints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanConfigEntry {
    pub path: PathBuf,
    pub id: Option<String>,
    /// Forced volume for the span; 0 when unforced.
    pub vol_idx: u8,
}

/// Parse span config text. The first token of a data line is the span
/// path; the rest are `id=<string>` and `volume=<n>` hints.
#[must_use]
pub fn parse_span_config(text: &str) -> (Vec<SpanConfigEntry>, Errata) {
    let mut zret = Errata::new();
    let mut entries = Vec::new();

    for (ln, line) in text.lines().enumerate() {
        let ln = ln + 1;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(path) = tokens.next() else {
            continue;
        };
        let mut entry = SpanConfigEntry {
            path: PathBuf::from(path),
            id: None,
            vol_idx: 0,
        };
        for token in tokens {
            let Some((tag, value)) = token.split_once('=') else {
                continue;
            };
            if tag.eq_ignore_ascii_case("id") {
                entry.id = Some(value.to_string());
            } else if tag.eq_ignore_ascii_case("volume") {
                match value.parse::<usize>() {
                    Ok(n) if (1..=MAX_VOLUME_IDX).contains(&n) => entry.vol_idx = n as u8,
                    _ => {
                        zret.push(
                            Severity::Error,
                            Code::ConfigParse,
                            format!("line {ln} has invalid volume index '{value}'"),
                        );
                    }
                }
            }
        }
        entries.push(entry);
    }
    (entries, zret)
}
