//! Basic (RFC 7617) and Digest (RFC 7616) authentication.
//!
//! The [`Authenticator`] starts out unauthenticated. The first `401` hands
//! it the server challenge; every request after that carries a matching
//! `Authorization` header.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `true` when the server offered `qop=auth`.
    pub qop_auth: bool,
    pub algorithm: String,
}

impl DigestChallenge {
    /// Parses the parameters of a `Digest` challenge.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }
        let mut params = challenge_params(rest);
        Some(Self {
            realm: params.remove("realm")?,
            nonce: params.remove("nonce")?,
            opaque: params.remove("opaque"),
            qop_auth: params
                .get("qop")
                .is_some_and(|qop| qop.split(',').any(|q| q.trim() == "auth")),
            algorithm: params
                .remove("algorithm")
                .unwrap_or_else(|| "MD5".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Digest(DigestChallenge),
}

impl Challenge {
    /// Picks the strongest scheme among `WWW-Authenticate` values.
    pub fn select<'a>(headers: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut basic = false;
        for header in headers {
            if let Some(digest) = DigestChallenge::parse(header) {
                return Some(Self::Digest(digest));
            }
            if header.trim_start().to_ascii_lowercase().starts_with("basic") {
                basic = true;
            }
        }
        basic.then_some(Self::Basic)
    }
}

#[derive(Debug, Default)]
struct DigestState {
    challenge: Option<DigestChallenge>,
    nc: u32,
}

/// Produces `Authorization` headers for one set of credentials.
#[derive(Debug)]
pub struct Authenticator {
    username: String,
    password: String,
    basic: Mutex<bool>,
    digest: Mutex<DigestState>,
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            basic: Mutex::new(false),
            digest: Mutex::new(DigestState::default()),
        }
    }

    /// Records a server challenge. Returns `false` when the challenge
    /// brings nothing new, i.e. the credentials were already rejected.
    pub fn accept(&self, challenge: Challenge) -> bool {
        match challenge {
            Challenge::Basic => {
                let mut basic = lock(&self.basic);
                !std::mem::replace(&mut *basic, true)
            }
            Challenge::Digest(challenge) => {
                let mut state = lock(&self.digest);
                let fresh = state
                    .challenge
                    .as_ref()
                    .is_none_or(|known| known.nonce != challenge.nonce);
                state.challenge = Some(challenge);
                state.nc = 0;
                fresh
            }
        }
    }

    /// Header for a request, if a challenge has been seen.
    pub fn header(&self, method: &str, uri: &str) -> Option<String> {
        {
            let mut state = lock(&self.digest);
            if state.challenge.is_some() {
                state.nc += 1;
                let nc = state.nc;
                if let Some(challenge) = state.challenge.as_ref() {
                    return Some(self.digest_header(challenge, nc, method, uri));
                }
            }
        }
        if *lock(&self.basic) {
            return Some(basic_header(&self.username, &self.password));
        }
        None
    }

    fn digest_header(&self, challenge: &DigestChallenge, nc: u32, method: &str, uri: &str) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, challenge.realm, self.password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nc);
        let cnonce = cnonce();

        let response = if challenge.qop_auth {
            md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, challenge.nonce, nc, cnonce, ha2))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
        };

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            self.username, challenge.realm, challenge.nonce, uri, response, challenge.algorithm
        );
        if challenge.qop_auth {
            header.push_str(&format!(r#", qop=auth, nc={}, cnonce="{}""#, nc, cnonce));
        }
        if let Some(ref opaque) = challenge.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        header
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn basic_header(username: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
    format!("Basic {}", encoded)
}

/// `key=value, key="quoted, value"` → map with lowercase keys.
fn challenge_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            (value, &quoted[end..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim().to_string(), &after[end..])
        };
        params.insert(key, value);
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

fn cnonce() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
