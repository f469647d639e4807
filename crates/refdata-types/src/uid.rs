use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::unsigned_bytes::UnsignedBytes;

/// Length in bytes of every UID.
pub const UID_LEN: usize = 4;

const UID_CODEC: UnsignedBytes = UnsignedBytes::FOUR;

/// Owned 4-byte surrogate identifier for a [`MapDefinition`](crate::MapDefinition).
///
/// A `Uid` stands in for the (variable length) map definition in every index
/// key so that keys stay compact. Ordering is unsigned numeric order, which is
/// also the byte-wise order of the big-endian encoding. Zero is a valid UID:
/// it is the first one ever allocated.
///
/// `Uid` owns its bytes, so it is safe to hold on to after the transaction
/// that produced it has ended. Use [`UidRef`] for a zero-copy view over
/// bytes that belong to somebody else.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// The first UID handed out by an empty store.
    pub const ZERO: Self = Self([0; UID_LEN]);

    /// The highest UID the 4-byte space can hold.
    pub const MAX: Self = Self([0xFF; UID_LEN]);

    /// Build a UID from its numeric value.
    pub const fn of(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Build a UID from its four raw bytes, most significant first.
    pub const fn from_parts(bytes: [u8; UID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a UID from a wider integer, failing if it does not fit in 4 bytes.
    pub fn try_of(value: u64) -> Result<Self, TypeError> {
        let mut bytes = [0u8; UID_LEN];
        UID_CODEC.put(&mut bytes, value)?;
        Ok(Self(bytes))
    }

    /// Defensive copy of exactly [`UID_LEN`] bytes into an owned UID.
    pub fn copy_of(bytes: &[u8]) -> Result<Self, TypeError> {
        UidRef::wrap(bytes).map(|view| view.to_uid())
    }

    /// Numeric value of this UID.
    pub fn value(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// The raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// Borrowed view over this UID's bytes.
    pub fn as_view(&self) -> UidRef<'_> {
        UidRef(&self.0)
    }

    /// The UID that follows this one.
    ///
    /// Fails with [`TypeError::UidOverflow`] rather than wrapping: widening
    /// the UID would change every key layout in the store.
    pub fn next(&self) -> Result<Self, TypeError> {
        self.value()
            .checked_add(1)
            .map(Self::of)
            .ok_or(TypeError::UidOverflow(self.value()))
    }

    /// Hex-encoded representation of the raw bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({} [{}])", self.value(), self.to_hex())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl From<[u8; UID_LEN]> for Uid {
    fn from(bytes: [u8; UID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Uid> for [u8; UID_LEN] {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

impl From<UidRef<'_>> for Uid {
    fn from(view: UidRef<'_>) -> Self {
        view.to_uid()
    }
}

/// Zero-copy view of a UID inside a borrowed buffer.
///
/// The lifetime ties the view to the buffer it wraps, typically bytes owned
/// by a storage transaction. Call [`UidRef::to_uid`] to take an owned copy
/// that may outlive the buffer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UidRef<'a>(&'a [u8; UID_LEN]);

impl<'a> UidRef<'a> {
    /// Wrap exactly [`UID_LEN`] bytes.
    pub fn wrap(bytes: &'a [u8]) -> Result<Self, TypeError> {
        let array: &'a [u8; UID_LEN] =
            bytes.try_into().map_err(|_| TypeError::InvalidLength {
                expected: UID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Wrap the leading [`UID_LEN`] bytes of a longer key.
    pub fn wrap_prefix(bytes: &'a [u8]) -> Result<Self, TypeError> {
        let prefix = bytes.get(..UID_LEN).ok_or(TypeError::InvalidLength {
            expected: UID_LEN,
            actual: bytes.len(),
        })?;
        Self::wrap(prefix)
    }

    /// The wrapped bytes, unchanged.
    pub fn backing_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn value(&self) -> u32 {
        u32::from_be_bytes(*self.0)
    }

    /// Owned copy, safe to use after the backing buffer is gone.
    pub fn to_uid(&self) -> Uid {
        Uid(*self.0)
    }

    pub fn next(&self) -> Result<Uid, TypeError> {
        self.to_uid().next()
    }
}

impl fmt::Debug for UidRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UidRef({})", self.value())
    }
}

impl PartialEq<Uid> for UidRef<'_> {
    fn eq(&self, other: &Uid) -> bool {
        self.0 == other.as_bytes()
    }
}

impl PartialEq<UidRef<'_>> for Uid {
    fn eq(&self, other: &UidRef<'_>) -> bool {
        &self.0 == other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_is_first() {
        assert_eq!(Uid::ZERO.value(), 0);
        assert_eq!(Uid::of(0), Uid::ZERO);
        assert!(Uid::ZERO < Uid::of(1));
    }

    #[test]
    fn from_parts_is_big_endian() {
        let uid = Uid::from_parts([0, 0, 1, 2]);
        assert_eq!(uid.value(), 258);
    }

    #[test]
    fn wrap_requires_exact_length() {
        let err = UidRef::wrap(&[0, 0, 1]).unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: UID_LEN,
                actual: 3
            }
        );
        assert!(UidRef::wrap(&[0, 0, 0, 1, 2]).is_err());
    }

    #[test]
    fn wrap_prefix_reads_leading_bytes() {
        let key = [0, 0, 0, 9, b'k', b'e', b'y'];
        let view = UidRef::wrap_prefix(&key).unwrap();
        assert_eq!(view.value(), 9);
        assert!(UidRef::wrap_prefix(&key[..2]).is_err());
    }

    #[test]
    fn next_increments() {
        assert_eq!(Uid::of(41).next().unwrap(), Uid::of(42));
    }

    #[test]
    fn next_fails_at_max() {
        let err = Uid::MAX.next().unwrap_err();
        assert_eq!(err, TypeError::UidOverflow(u32::MAX));
    }

    #[test]
    fn try_of_rejects_wide_values() {
        assert_eq!(Uid::try_of(7).unwrap(), Uid::of(7));
        assert!(Uid::try_of(1u64 << 32).is_err());
    }

    #[test]
    fn owned_copy_outlives_buffer() {
        let uid = {
            let buf = vec![0u8, 0, 0, 5];
            let view = UidRef::wrap(&buf).unwrap();
            view.to_uid()
        };
        assert_eq!(uid.value(), 5);
    }

    #[test]
    fn view_and_owned_compare_equal() {
        let uid = Uid::of(300);
        let bytes = *uid.as_bytes();
        let view = UidRef::wrap(&bytes).unwrap();
        assert_eq!(view, uid);
        assert_eq!(uid, view);
        assert_eq!(uid.as_view(), view);
    }

    #[test]
    fn display_and_debug() {
        let uid = Uid::of(10);
        assert_eq!(format!("{uid}"), "10");
        assert_eq!(format!("{uid:?}"), "Uid(10 [0000000a])");
    }

    #[test]
    fn serde_roundtrip() {
        let uid = Uid::of(123_456);
        let json = serde_json::to_string(&uid).unwrap();
        let parsed: Uid = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, parsed);
    }

    proptest! {
        #[test]
        fn wrap_preserves_backing_bytes(bytes in any::<[u8; 4]>()) {
            let view = UidRef::wrap(&bytes).unwrap();
            prop_assert_eq!(view.backing_bytes(), &bytes[..]);
        }

        #[test]
        fn of_preserves_value(n in any::<u32>()) {
            prop_assert_eq!(Uid::of(n).value(), n);
            prop_assert_eq!(Uid::try_of(n as u64).unwrap().value(), n);
        }

        #[test]
        fn byte_order_matches_numeric_order(a in any::<u32>(), b in any::<u32>()) {
            prop_assert_eq!(Uid::of(a).cmp(&Uid::of(b)), a.cmp(&b));
            prop_assert_eq!(Uid::of(a).as_bytes().cmp(Uid::of(b).as_bytes()), a.cmp(&b));
        }
    }
}
