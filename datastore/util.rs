use quarry_schema::schema::Generator;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current time as an RFC 3339 string, the canonical `DateTime` encoding.
pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("formatting a UTC timestamp cannot fail")
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis()
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const CROCKFORD32: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const NANOID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

fn base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn random_chars(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Generates one id for a `@default(...)` generator declaration.
///
/// `now` and `autoincrement` are not client-side generators and are handled
/// by the caller; this function only produces textual ids.
pub fn generate_id(generator: Generator) -> String {
    match generator {
        Generator::Cuid => format!("c{}{}", base36(unix_millis()), random_chars(BASE36, 16)),
        Generator::Uuid => Uuid::new_v4().to_string(),
        Generator::Ulid => ulid(),
        Generator::Nanoid => random_chars(NANOID_ALPHABET, 21),
        Generator::Now | Generator::Autoincrement => {
            unreachable!("not a client-side id generator")
        }
    }
}

/// 26-char Crockford base32: 48-bit timestamp followed by 80 random bits.
fn ulid() -> String {
    let ts = unix_millis() as u64 & ((1 << 48) - 1);
    let mut out = String::with_capacity(26);
    for i in (0..10).rev() {
        out.push(CROCKFORD32[((ts >> (i * 5)) & 0x1f) as usize] as char);
    }
    out.push_str(&random_chars(CROCKFORD32, 16));
    out
}

/// Expands a default-value format string: each `%s` is replaced by a freshly
/// generated id (so `%s%s` yields two distinct ids); `\%s` is a literal `%s`.
pub fn expand_format(format: &str, mut generate: impl FnMut() -> String) -> String {
    let mut out = String::with_capacity(format.len());
    let mut rest = format;
    loop {
        match rest.find("%s") {
            None => {
                out.push_str(rest);
                return out;
            }
            Some(pos) => {
                if rest[..pos].ends_with('\\') {
                    out.push_str(&rest[..pos - 1]);
                    out.push_str("%s");
                } else {
                    out.push_str(&rest[..pos]);
                    out.push_str(&generate());
                }
                rest = &rest[pos + 2..];
            }
        }
    }
}

/// Returns the longest possible prefix of `s` that is at most `max_len`
/// bytes long and ends at a character boundary so that we don't break
/// multi-byte characters.
fn max_prefix(s: &str, max_len: usize) -> &str {
    if max_len >= s.len() {
        return s;
    }
    let mut idx = max_len;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Truncates a database identifier (column/table alias) to 63 bytes to make
/// it Postgres-compatible.
pub fn truncate_identifier(s: &str) -> &str {
    max_prefix(s, 63)
}

/// Splits an identifier into word tokens. Boundaries are `_`, `-`, spaces,
/// lower→upper transitions, and letter→digit transitions. All-uppercase
/// tokens are preserved verbatim by the casing helpers below.
fn split_words(ident: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    for c in ident.chars() {
        if c == '_' || c == '-' || c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev = None;
            continue;
        }
        if let Some(p) = prev {
            let boundary = (p.is_lowercase() && c.is_uppercase())
                || (p.is_alphabetic() && c.is_numeric());
            if boundary && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
        prev = Some(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn is_all_caps(word: &str) -> bool {
    word.len() > 1 && word.chars().all(|c| !c.is_lowercase())
}

fn prefix_if_digit(s: String) -> String {
    match s.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("_{s}"),
        _ => s,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
    }
}

pub fn pascal_case(ident: &str) -> String {
    let out = split_words(ident)
        .iter()
        .map(|w| {
            if is_all_caps(w) {
                w.clone()
            } else {
                capitalize(w)
            }
        })
        .collect::<String>();
    prefix_if_digit(out)
}

pub fn camel_case(ident: &str) -> String {
    let words = split_words(ident);
    let mut out = String::new();
    for (i, w) in words.iter().enumerate() {
        if is_all_caps(w) {
            out.push_str(w);
        } else if i == 0 {
            out.push_str(&w.to_lowercase());
        } else {
            out.push_str(&capitalize(w));
        }
    }
    prefix_if_digit(out)
}

pub fn snake_case(ident: &str) -> String {
    let out = split_words(ident)
        .iter()
        .map(|w| {
            if is_all_caps(w) {
                w.clone()
            } else {
                w.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("_");
    prefix_if_digit(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_expand_format() {
        let mut n = 0;
        let mut gen = || {
            n += 1;
            format!("id{n}")
        };
        assert_eq!(expand_format("prefix_%s_suffix", &mut gen), "prefix_id1_suffix");
        assert_eq!(expand_format("%s%s", &mut gen), "id2id3");
        assert_eq!(expand_format(r"\%s", &mut gen), "%s");
        assert_eq!(expand_format("no placeholder", &mut gen), "no placeholder");
    }

    #[test]
    fn test_generated_ids_are_unique_and_shaped() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let cuid = generate_id(Generator::Cuid);
            assert!(cuid.starts_with('c'));
            let ulid = generate_id(Generator::Ulid);
            assert_eq!(ulid.len(), 26);
            let nano = generate_id(Generator::Nanoid);
            assert_eq!(nano.len(), 21);
            assert!(seen.insert(cuid));
            assert!(seen.insert(ulid));
            assert!(seen.insert(nano));
        }
    }

    #[test]
    fn test_casing() {
        assert_eq!(pascal_case("user_profile"), "UserProfile");
        assert_eq!(camel_case("user_profile"), "userProfile");
        assert_eq!(snake_case("UserProfile"), "user_profile");
        // All-uppercase tokens are preserved verbatim.
        assert_eq!(pascal_case("HTTP_server"), "HTTPServer");
        assert_eq!(snake_case("HTTP_server"), "HTTP_server");
        // Identifiers starting with a digit get a `_` prefix.
        assert_eq!(pascal_case("2fa_token"), "_2faToken");
        assert_eq!(camel_case("2fa_token"), "_2faToken");
    }

    #[test]
    fn test_truncate_identifier() {
        let long = "x".repeat(100);
        assert_eq!(truncate_identifier(&long).len(), 63);
        assert_eq!(truncate_identifier("short"), "short");
    }
}
