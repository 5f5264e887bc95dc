//! A single line of an OpenSSH `known_hosts` file.
//!
//! ```text
//! [@cert-authority|@revoked] patterns keytype base64-key [comment]
//! ```
//!
//! Patterns are comma separated, may contain `*` and `?` wildcards and may be
//! negated with a leading `!`. A hashed entry (`|1|salt|hash`) stores the
//! HMAC-SHA1 of the host name keyed with the salt instead of the name itself.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use russh::keys::ssh_key::{public::KeyData, PublicKey};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use super::PeerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    CertAuthority,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPatterns {
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
    Plain(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct TrustEntry {
    marker: Option<Marker>,
    hosts: HostPatterns,
    key: PublicKey,
}

impl TrustEntry {
    /// Parses one line. Blank lines and comments yield `None`.
    pub fn parse(line: &str) -> Option<Result<TrustEntry, String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some(parse_fields(line))
    }

    pub fn new(peer: &PeerAddress, key: &KeyData) -> TrustEntry {
        TrustEntry {
            marker: None,
            hosts: HostPatterns::Plain(vec![peer.known_hosts_name()]),
            key: PublicKey::from(key.clone()),
        }
    }

    pub fn marker(&self) -> Option<Marker> {
        self.marker
    }

    pub fn key(&self) -> &KeyData {
        self.key.key_data()
    }

    pub fn matches(&self, peer: &PeerAddress) -> bool {
        let name = peer.known_hosts_name();
        match &self.hosts {
            HostPatterns::Hashed { salt, hash } => hashed_name_matches(salt, hash, &name),
            HostPatterns::Plain(patterns) => {
                let mut matched = false;
                for pattern in patterns {
                    if let Some(negated) = pattern.strip_prefix('!') {
                        if wildcard_match(negated, &name) {
                            return false;
                        }
                    } else if wildcard_match(pattern, &name) {
                        matched = true;
                    }
                }
                matched
            }
        }
    }

    /// The line written when a new host is persisted.
    pub fn to_line(&self) -> Result<String, String> {
        let hosts = match &self.hosts {
            HostPatterns::Plain(patterns) => patterns.join(","),
            HostPatterns::Hashed { salt, hash } => {
                format!("|1|{}|{}", STANDARD.encode(salt), STANDARD.encode(hash))
            }
        };
        let key = self.key.to_openssh().map_err(|err| err.to_string())?;
        let marker = match self.marker {
            Some(Marker::CertAuthority) => "@cert-authority ",
            Some(Marker::Revoked) => "@revoked ",
            None => "",
        };
        Ok(format!("{marker}{hosts} {key}"))
    }
}

fn parse_fields(line: &str) -> Result<TrustEntry, String> {
    let mut fields = line.split_whitespace();
    let mut first = fields.next().ok_or("empty line")?;

    let marker = match first {
        "@cert-authority" => Some(Marker::CertAuthority),
        "@revoked" => Some(Marker::Revoked),
        other if other.starts_with('@') => return Err(format!("unknown marker {other}")),
        _ => None,
    };
    if marker.is_some() {
        first = fields.next().ok_or("missing host patterns")?;
    }

    let key_type = fields.next().ok_or("missing key type")?;
    let key_base64 = fields.next().ok_or("missing key data")?;
    let key = PublicKey::from_openssh(&format!("{key_type} {key_base64}"))
        .map_err(|err| format!("invalid {key_type} key: {err}"))?;

    Ok(TrustEntry {
        marker,
        hosts: parse_hosts(first)?,
        key,
    })
}

fn parse_hosts(field: &str) -> Result<HostPatterns, String> {
    if let Some(hashed) = field.strip_prefix("|1|") {
        let (salt, hash) = hashed.split_once('|').ok_or("malformed hashed host")?;
        let salt = STANDARD.decode(salt).map_err(|err| format!("bad hashed host salt: {err}"))?;
        let hash = STANDARD.decode(hash).map_err(|err| format!("bad hashed host hash: {err}"))?;
        return Ok(HostPatterns::Hashed { salt, hash });
    }
    let patterns: Vec<String> = field
        .split(',')
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    if patterns.is_empty() {
        return Err("no host patterns".into());
    }
    Ok(HostPatterns::Plain(patterns))
}

fn hashed_name_matches(salt: &[u8], hash: &[u8], name: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
        return false;
    };
    mac.update(name.as_bytes());
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(hash).into()
}

/// Glob match supporting `*` and `?`, case-insensitive.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let name: Vec<char> = name.to_ascii_lowercase().chars().collect();

    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    p = star + 1;
                    n = consumed + 1;
                    backtrack = Some((star, consumed + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_KEY: &str = include_str!("../../tests/fixtures/host_key.pub");

    fn peer(host: &str, port: u16) -> PeerAddress {
        PeerAddress::new(host, port)
    }

    fn entry(line: &str) -> TrustEntry {
        TrustEntry::parse(line).unwrap().unwrap()
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.example.com", "sftp.example.com"));
        assert!(wildcard_match("sftp?.example.com", "sftp1.example.com"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(!wildcard_match("sftp?.example.com", "sftp.example.com"));
        assert!(wildcard_match("SFTP.*.COM", "sftp.example.com"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert!(TrustEntry::parse("").is_none());
        assert!(TrustEntry::parse("   # comment").is_none());
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(TrustEntry::parse("host-only").unwrap().is_err());
        assert!(TrustEntry::parse("host ssh-ed25519 !!!").unwrap().is_err());
        assert!(TrustEntry::parse("@bogus host ssh-ed25519 AAAA").unwrap().is_err());
    }

    #[test]
    fn comma_patterns_with_negation() {
        let key = HOST_KEY.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let wildcard = entry(&format!("*.example.com,!bad.example.com {key}"));
        assert!(wildcard.matches(&peer("sftp.example.com", 22)));
        assert!(!wildcard.matches(&peer("bad.example.com", 22)));
        assert!(!wildcard.matches(&peer("sftp.example.org", 22)));
    }

    #[test]
    fn non_default_port_uses_bracketed_name() {
        let key = HOST_KEY.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let bracketed = entry(&format!("[sftp.example.com]:2222 {key}"));
        assert!(bracketed.matches(&peer("sftp.example.com", 2222)));
        assert!(!bracketed.matches(&peer("sftp.example.com", 22)));
    }

    #[test]
    fn hashed_host_names() {
        let hashed = entry(include_str!("../../tests/fixtures/known_hosts_hashed"));
        assert!(hashed.matches(&peer("hashed.example.com", 22)));
        assert!(!hashed.matches(&peer("sftp.example.com", 22)));
    }

    #[test]
    fn markers_are_recognised() {
        let authority = entry(include_str!("../../tests/fixtures/known_hosts_ca"));
        assert_eq!(authority.marker(), Some(Marker::CertAuthority));
        let revoked = entry(include_str!("../../tests/fixtures/known_hosts_revoked"));
        assert_eq!(revoked.marker(), Some(Marker::Revoked));
    }

    #[test]
    fn new_entry_serialises_to_openssh_line() {
        let key = PublicKey::from_openssh(HOST_KEY.trim()).unwrap();
        let line = TrustEntry::new(&peer("sftp.example.com", 2222), key.key_data())
            .to_line()
            .unwrap();
        assert!(line.starts_with("[sftp.example.com]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5"));
        let reparsed = entry(&line);
        assert_eq!(reparsed.key(), key.key_data());
    }
}
