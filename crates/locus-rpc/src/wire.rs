//! Payload marshalling.
//!
//! Fixed-width integers are little-endian. Byte strings carry a 16-bit
//! length prefix; node ids are 20 raw bytes; ranges are a node id plus
//! an 8-bit mask; addresses travel in their textual form; geographic
//! points are two IEEE-754 doubles; maps and vectors carry a 16-bit
//! count followed by their entries.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use locus_common::{Address, GeoPoint, LocusError, LocusResult, NodeId, NodeIdRange};

/// Types that can be written to a wire payload.
pub trait WireEncode {
    /// Appends the wire form of `self` to the buffer.
    fn encode(&self, buf: &mut impl BufMut);
}

/// Types that can be read back from a wire payload.
pub trait WireDecode: Sized {
    /// Parses one value off the front of the buffer.
    fn decode(buf: &mut impl Buf) -> LocusResult<Self>;
}

fn ensure(buf: &impl Buf, needed: usize, what: &str) -> LocusResult<()> {
    if buf.remaining() < needed {
        return Err(LocusError::malformed(format!(
            "truncated {what}: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

macro_rules! int_wire {
    ($ty:ty, $put:ident, $get:ident) => {
        impl WireEncode for $ty {
            fn encode(&self, buf: &mut impl BufMut) {
                buf.$put(*self);
            }
        }
        impl WireDecode for $ty {
            fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
                ensure(buf, std::mem::size_of::<$ty>(), stringify!($ty))?;
                Ok(buf.$get())
            }
        }
    };
}

int_wire!(u16, put_u16_le, get_u16_le);
int_wire!(u32, put_u32_le, get_u32_le);
int_wire!(u64, put_u64_le, get_u64_le);

impl WireEncode for u8 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self);
    }
}

impl WireDecode for u8 {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        ensure(buf, 1, "u8")?;
        Ok(buf.get_u8())
    }
}

impl WireEncode for f64 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64_le(*self);
    }
}

impl WireDecode for f64 {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        ensure(buf, 8, "f64")?;
        Ok(buf.get_f64_le())
    }
}

impl WireEncode for str {
    fn encode(&self, buf: &mut impl BufMut) {
        debug_assert!(self.len() <= u16::MAX as usize);
        buf.put_u16_le(self.len() as u16);
        buf.put_slice(self.as_bytes());
    }
}

impl WireEncode for String {
    fn encode(&self, buf: &mut impl BufMut) {
        self.as_str().encode(buf);
    }
}

impl WireDecode for String {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let len = u16::decode(buf)? as usize;
        ensure(buf, len, "string body")?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).map_err(|_| LocusError::malformed("string is not UTF-8"))
    }
}

impl WireEncode for NodeId {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.as_bytes());
    }
}

impl WireDecode for NodeId {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        ensure(buf, NodeId::LEN, "node id")?;
        let mut bytes = [0u8; NodeId::LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(NodeId::from_bytes(bytes))
    }
}

impl WireEncode for NodeIdRange {
    fn encode(&self, buf: &mut impl BufMut) {
        self.from().encode(buf);
        buf.put_u8(self.mask());
    }
}

impl WireDecode for NodeIdRange {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let from = NodeId::decode(buf)?;
        let mask = u8::decode(buf)?;
        if !NodeIdRange::is_aligned(&from, mask) {
            return Err(LocusError::malformed(format!(
                "misaligned range {}/{mask}",
                from.to_hex()
            )));
        }
        Ok(NodeIdRange::new(from, mask))
    }
}

impl WireEncode for GeoPoint {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64_le(self.latitude);
        buf.put_f64_le(self.longitude);
    }
}

impl WireDecode for GeoPoint {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let latitude = f64::decode(buf)?;
        let longitude = f64::decode(buf)?;
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(LocusError::malformed("non-finite coordinate"));
        }
        Ok(GeoPoint {
            latitude,
            longitude,
        })
    }
}

impl WireEncode for Address {
    fn encode(&self, buf: &mut impl BufMut) {
        self.to_string().encode(buf);
    }
}

impl WireDecode for Address {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let text = String::decode(buf)?;
        text.parse()
            .map_err(|_| LocusError::malformed(format!("invalid address {text:?}")))
    }
}

impl WireEncode for BTreeMap<String, String> {
    fn encode(&self, buf: &mut impl BufMut) {
        debug_assert!(self.len() <= u16::MAX as usize);
        buf.put_u16_le(self.len() as u16);
        for (key, value) in self {
            key.encode(buf);
            value.encode(buf);
        }
    }
}

impl WireDecode for BTreeMap<String, String> {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let count = u16::decode(buf)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = String::decode(buf)?;
            let value = String::decode(buf)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, buf: &mut impl BufMut) {
        debug_assert!(self.len() <= u16::MAX as usize);
        buf.put_u16_le(self.len() as u16);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: WireDecode> WireDecode for Vec<T> {
    fn decode(buf: &mut impl Buf) -> LocusResult<Self> {
        let count = u16::decode(buf)?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip<T: WireEncode + WireDecode + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        let mut read = buf.freeze();
        let decoded = T::decode(&mut read).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(read.remaining(), 0, "trailing bytes after decode");
    }

    #[test]
    fn test_integer_roundtrip() {
        roundtrip(0x1234u16);
        roundtrip(0xDEAD_BEEFu32);
        roundtrip(0x0123_4567_89AB_CDEFu64);
        roundtrip(42u8);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut buf = BytesMut::new();
        0x1234u16.encode(&mut buf);
        assert_eq!(&buf[..], &[0x34, 0x12]);
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(String::new());
        roundtrip("hello".to_string());
        roundtrip("snow ❄".to_string());
    }

    #[test]
    fn test_string_rejects_bad_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(2);
        buf.put_slice(&[0xFF, 0xFE]);
        assert!(String::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_node_id_roundtrip() {
        let mut id = NodeId::ZERO;
        id.set_bit_at(0, true);
        id.set_bit_at(77, true);
        id.mark_set();
        roundtrip(id);
    }

    #[test]
    fn test_range_roundtrip_and_alignment() {
        let (left, right) = NodeIdRange::UNIVERSAL.split();
        roundtrip(NodeIdRange::UNIVERSAL);
        roundtrip(left);
        roundtrip(right);

        // a from with bits beyond the mask must be rejected
        let mut buf = BytesMut::new();
        let mut bad = NodeId::ZERO;
        bad.set_bit_at(10, true);
        bad.encode(&mut buf);
        buf.put_u8(5);
        assert!(NodeIdRange::decode(&mut buf.freeze()).is_err());

        // so must an oversized mask
        let mut buf = BytesMut::new();
        NodeId::ZERO.encode(&mut buf);
        buf.put_u8(161);
        assert!(NodeIdRange::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_geo_point_roundtrip() {
        roundtrip(GeoPoint {
            latitude: 37.4,
            longitude: -122.1,
        });
        let mut buf = BytesMut::new();
        buf.put_f64_le(f64::NAN);
        buf.put_f64_le(0.0);
        assert!(GeoPoint::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_address_roundtrip() {
        roundtrip("127.0.0.1:7777".parse::<Address>().unwrap());
        roundtrip("[::1]:9000".parse::<Address>().unwrap());
    }

    #[test]
    fn test_map_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), "alice".to_string());
        map.insert("team".to_string(), "blue".to_string());
        roundtrip(map);
        roundtrip(BTreeMap::<String, String>::new());
    }

    #[test]
    fn test_vec_roundtrip() {
        let mut a = NodeId::ZERO;
        a.mark_set();
        let mut b = NodeId::ZERO;
        b.set_bit_at(1, true);
        b.mark_set();
        roundtrip(vec![a, b]);
        roundtrip(Vec::<NodeId>::new());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(10);
        buf.put_slice(b"abc");
        assert!(String::decode(&mut buf.freeze()).is_err());

        let mut short = BytesMut::new();
        short.put_slice(&[0u8; 10]);
        assert!(NodeId::decode(&mut short.freeze()).is_err());
    }

    #[test]
    fn test_randomized_roundtrips() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);

        for _ in 0..200 {
            roundtrip(rng.gen::<u64>());
            roundtrip(rng.gen::<u32>());
            roundtrip(rng.gen::<u16>());

            let mut bytes = [0u8; NodeId::LEN];
            rng.fill(&mut bytes[..]);
            roundtrip(NodeId::from_bytes(bytes));

            let len = rng.gen_range(0..64);
            let text: String = (0..len).map(|_| rng.gen_range('a'..='z')).collect();
            roundtrip(text);

            let point = GeoPoint::new(
                rng.gen_range(-90.0..=90.0),
                rng.gen_range(-180.0..180.0),
            );
            roundtrip(point);

            // an aligned range with a random mask
            let mask = rng.gen_range(0..=160u16) as u8;
            let mut from = NodeId::ZERO;
            for pos in 0..mask {
                from.set_bit_at(pos, rng.gen());
            }
            roundtrip(NodeIdRange::new(from, mask));
        }
    }

    #[test]
    fn test_random_garbage_never_panics() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let len = rng.gen_range(0..64);
            let mut bytes = vec![0u8; len];
            rng.fill(&mut bytes[..]);
            let buf = bytes::Bytes::from(bytes);

            // decoding may fail, but must never panic
            let _ = String::decode(&mut buf.clone());
            let _ = NodeIdRange::decode(&mut buf.clone());
            let _ = Address::decode(&mut buf.clone());
            let _ = BTreeMap::<String, String>::decode(&mut buf.clone());
            let _ = Vec::<NodeId>::decode(&mut buf.clone());
        }
    }
}
