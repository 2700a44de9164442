//! Logical key layout of the encrypted key-value store.
//!
//! ```text
//! {project}/{repo}/objs/<20-byte object id>
//! {project}/{repo}/refs/<ref name>
//! {project}/{repo}/rev2sha/<4-byte big-endian revision>
//! ```

const OBJS: &[u8] = b"objs/";
const REFS: &[u8] = b"refs/";
const REV2SHA: &[u8] = b"rev2sha/";

const OBJECT_ID_LEN: usize = 20;
const REVISION_LEN: usize = 4;

/// What a logical key under a repository prefix addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Object,
    Ref,
    Revision,
    /// a key that matches none of the known layouts
    Unknown,
}

/// Builds the logical keys of one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryKeys {
    prefix: Vec<u8>,
}

impl RepositoryKeys {
    pub fn new(project: &str, repo: &str) -> Self {
        Self {
            prefix: format!("{}/{}/", project, repo).into_bytes(),
        }
    }

    /// the prefix shared by every key of the repository
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn join(&self, section: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + section.len() + suffix.len());
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(section);
        key.extend_from_slice(suffix);
        key
    }

    pub fn object(&self, id: &[u8]) -> Vec<u8> {
        self.join(OBJS, id)
    }

    pub fn objects_prefix(&self) -> Vec<u8> {
        self.join(OBJS, b"")
    }

    pub fn reference(&self, name: &str) -> Vec<u8> {
        self.join(REFS, name.as_bytes())
    }

    pub fn refs_prefix(&self) -> Vec<u8> {
        self.join(REFS, b"")
    }

    pub fn revision(&self, major: i32) -> Vec<u8> {
        self.join(REV2SHA, &major.to_be_bytes())
    }

    pub fn revisions_prefix(&self) -> Vec<u8> {
        self.join(REV2SHA, b"")
    }

    /// Classify a key of this repository by its section and suffix length.
    pub fn classify(&self, key: &[u8]) -> KeyKind {
        let Some(rest) = key.strip_prefix(self.prefix.as_slice()) else {
            return KeyKind::Unknown;
        };
        if let Some(id) = rest.strip_prefix(OBJS) {
            if id.len() == OBJECT_ID_LEN {
                return KeyKind::Object;
            }
        } else if let Some(name) = rest.strip_prefix(REFS) {
            if !name.is_empty() && std::str::from_utf8(name).is_ok() {
                return KeyKind::Ref;
            }
        } else if let Some(rev) = rest.strip_prefix(REV2SHA) {
            if rev.len() == REVISION_LEN {
                return KeyKind::Revision;
            }
        }
        KeyKind::Unknown
    }

    /// the object id bytes of an object key
    pub fn object_id<'a>(&self, key: &'a [u8]) -> Option<&'a [u8]> {
        key.strip_prefix(self.prefix.as_slice())?
            .strip_prefix(OBJS)
            .filter(|id| id.len() == OBJECT_ID_LEN)
    }

    /// the ref name of a ref key
    pub fn ref_name<'a>(&self, key: &'a [u8]) -> Option<&'a str> {
        let name = key.strip_prefix(self.prefix.as_slice())?.strip_prefix(REFS)?;
        std::str::from_utf8(name).ok().filter(|name| !name.is_empty())
    }

    /// the revision number of a rev2sha key
    pub fn revision_of(&self, key: &[u8]) -> Option<i32> {
        let rev = key.strip_prefix(self.prefix.as_slice())?.strip_prefix(REV2SHA)?;
        let bytes: [u8; REVISION_LEN] = rev.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }
}

/// Printable form of a key for log lines.
///
/// The textual part is kept as is and any binary tail (object ids,
/// big-endian revisions) is hex-encoded.
pub(crate) fn describe(key: &[u8]) -> String {
    let mut slashes = key.iter().enumerate().filter(|(_, b)| **b == b'/').map(|(i, _)| i);
    if let (Some(_), Some(second)) = (slashes.next(), slashes.next()) {
        let rest = &key[second + 1..];
        for section in [OBJS, REV2SHA] {
            if rest.starts_with(section) {
                let split = second + 1 + section.len();
                return format!("{}{}", String::from_utf8_lossy(&key[..split]), hex::encode(&key[split..]));
            }
        }
    }
    match std::str::from_utf8(key) {
        Ok(text) => text.to_string(),
        Err(_) => hex::encode(key),
    }
}

/// The smallest key greater than every key starting with `prefix`.
///
/// `None` when no such key exists (the prefix is all `0xff`).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_hex_encodes_binary_tails() {
        let keys = RepositoryKeys::new("p", "r");
        assert_eq!(describe(&keys.revision(2)), "p/r/rev2sha/00000002");
        assert_eq!(describe(&keys.object(&[0xab; 20])), format!("p/r/objs/{}", "ab".repeat(20)));
        assert_eq!(describe(&keys.reference("refs/heads/master")), "p/r/refs/refs/heads/master");
    }

    #[test]
    fn key_layout() {
        let keys = RepositoryKeys::new("foo", "bar");
        assert_eq!(keys.prefix(), b"foo/bar/");
        assert_eq!(keys.reference("refs/heads/master"), b"foo/bar/refs/refs/heads/master".to_vec());
        assert_eq!(keys.revision(2), b"foo/bar/rev2sha/\x00\x00\x00\x02".to_vec());
    }

    #[test]
    fn classify_keys() {
        let keys = RepositoryKeys::new("foo", "bar");
        assert_eq!(keys.classify(&keys.object(&[7u8; 20])), KeyKind::Object);
        assert_eq!(keys.classify(&keys.object(&[7u8; 3])), KeyKind::Unknown);
        assert_eq!(keys.classify(&keys.reference("HEAD")), KeyKind::Ref);
        assert_eq!(keys.classify(&keys.revision(42)), KeyKind::Revision);
        assert_eq!(keys.classify(b"foo/bar/other/x"), KeyKind::Unknown);
        assert_eq!(keys.classify(b"foo/baz/refs/x"), KeyKind::Unknown);
    }

    #[test]
    fn suffix_extraction() {
        let keys = RepositoryKeys::new("foo", "bar");
        assert_eq!(keys.revision_of(&keys.revision(42)), Some(42));
        assert_eq!(keys.object_id(&keys.object(&[1u8; 20])), Some(&[1u8; 20][..]));
        assert_eq!(keys.ref_name(&keys.reference("master")), Some("master"));
    }

    #[test]
    fn upper_bound() {
        assert_eq!(prefix_upper_bound(b"foo/bar/"), Some(b"foo/bar0".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }
}
