use refdata_types::TypedBytes;

/// Domain-separated BLAKE3 hasher for stored values.
///
/// The type id is hashed along with the payload, so identical bytes under
/// different value types address different value store entries. Only the
/// first eight bytes of the digest are kept; collisions are resolved by the
/// value store's unique id suffix.
pub struct ValueHasher {
    domain: &'static str,
}

impl ValueHasher {
    pub const VALUE: Self = Self {
        domain: "refdata-value-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    pub fn hash(&self, value: &TypedBytes) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(&[value.type_id]);
        hasher.update(&value.bytes);
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(prefix)
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}
