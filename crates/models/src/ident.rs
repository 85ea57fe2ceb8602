use uuid::Uuid;

/// Numeric dataset ids are five digits, minted from a monotonic counter.
pub const NUMERIC_ID_MIN: i64 = 10_000;
pub const NUMERIC_ID_MAX: i64 = 99_999;

/// Identifier is the classified form of a client-supplied dataset
/// identifier. Classification is purely lexical; the catalog decides whether
/// the identifier actually resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Canonical 8-4-4-4-12 hyphenated hex UUID.
    Uuid(Uuid),
    /// All-digit numeric id.
    Numeric(i64),
    /// Anything else: tried as a slug first, then as a dataset name.
    Text(String),
}

impl Identifier {
    pub fn classify(raw: &str) -> Identifier {
        if is_canonical_uuid(raw) {
            if let Ok(uuid) = Uuid::parse_str(raw) {
                return Identifier::Uuid(uuid);
            }
        }
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = raw.parse::<i64>() {
                return Identifier::Numeric(n);
            }
        }
        Identifier::Text(raw.to_string())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Uuid(uuid) => write!(f, "{uuid}"),
            Identifier::Numeric(n) => write!(f, "{n}"),
            Identifier::Text(s) => f.write_str(s),
        }
    }
}

// Uuid::parse_str also accepts un-hyphenated and braced forms, which must
// fall through to slug/name lookup, so the canonical shape is checked first.
fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

/// Derive the base slug for a dataset: lower-cased name with non-alphanumeric
/// runs collapsed to single hyphens, prefixed by the first segment of the
/// owner's email and suffixed with the four-digit year. Uniqueness suffixes
/// (`-2`, `-3`, ...) are the catalog's concern.
pub fn derive_slug(name: &str, owner_email: &str, year: i32) -> String {
    let owner_prefix: String = owner_email
        .split('@')
        .next()
        .unwrap_or(owner_email)
        .split('.')
        .next()
        .unwrap_or("")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let mut slug = String::with_capacity(owner_prefix.len() + name.len() + 6);
    if !owner_prefix.is_empty() {
        slug.push_str(&owner_prefix);
    }

    let mut pending_hyphen = !slug.is_empty();
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen {
                slug.push('-');
                pending_hyphen = false;
            }
            slug.push(c);
        } else if !slug.is_empty() {
            pending_hyphen = true;
        }
    }

    if !slug.is_empty() {
        slug.push('-');
    }
    slug.push_str(&format!("{year:04}"));
    slug
}
