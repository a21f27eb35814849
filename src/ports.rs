use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::PortListError;

/// ポート番号の集合
///
/// 文法: カンマ区切りのトークン。各トークンは `1..65535` の単一ポート、
/// または `start < end` を満たす `start-end` の範囲。空白は一切許可しない。
/// 空文字列は空の集合として扱う。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortList(BTreeSet<u16>);

impl PortList {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self(ports.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn as_set(&self) -> &BTreeSet<u16> {
        &self.0
    }

    pub fn into_set(self) -> BTreeSet<u16> {
        self.0
    }

    /// `self` に含まれないポートを昇順で返す
    pub fn missing_from(&self, allowed: &PortList) -> Vec<u16> {
        self.0.difference(&allowed.0).copied().collect()
    }
}

impl FromStr for PortList {
    type Err = PortListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_port_list(s).map(PortList)
    }
}

impl TryFrom<String> for PortList {
    type Error = PortListError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for PortList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for port in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", port)?;
            first = false;
        }
        Ok(())
    }
}

/// ポートリスト文字列をパース
pub fn parse_port_list(s: &str) -> Result<BTreeSet<u16>, PortListError> {
    let mut ports = BTreeSet::new();
    if s.is_empty() {
        return Ok(ports);
    }

    for token in s.split(',') {
        match token.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start, token)?;
                let end = parse_port(end, token)?;
                if start >= end {
                    return Err(PortListError::InvalidRange(token.to_string()));
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(parse_port(token, token)?);
            }
        }
    }

    Ok(ports)
}

fn parse_port(s: &str, token: &str) -> Result<u16, PortListError> {
    if token.is_empty() {
        return Err(PortListError::EmptyToken);
    }
    // `u16::from_str` は先頭の `+` を受け付けるので数字のみを事前に確認する
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortListError::InvalidPort(token.to_string()));
    }
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(PortListError::InvalidPort(token.to_string())),
        Ok(port) => Ok(port),
    }
}
