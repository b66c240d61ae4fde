//! Per-address member record.
//!
//! A member is created on its first join and never removed: parting only
//! clears the `active` flag so accumulated earnings survive a rejoin.
//! Earnings are 256-bit non-negative integers and are serialized as decimal
//! strings; no floating point anywhere on this path.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Serde adapter: `U256` as a decimal string.
///
/// The JSON form `"1000000000000000000"` round-trips without precision loss,
/// which `u64`/`f64` representations cannot guarantee for token amounts.
pub mod serde_decimal {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom)
    }
}

/// Parse an ingested address string into its canonical 20-byte form.
///
/// Accepts `0x`-prefixed hex of any case. Anything else is rejected with
/// [`Error::BadAddress`] before it can reach the member set.
pub fn parse_address(input: &str) -> Result<Address> {
    input
        .trim()
        .parse::<Address>()
        .map_err(|_| Error::BadAddress(input.to_string()))
}

/// One member of the community: address, cumulative earnings, activity flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Canonical 20-byte address. Immutable once constructed.
    pub address: Address,
    /// Cumulative earnings. Monotonically non-decreasing for the lifetime
    /// of the member.
    #[serde(with = "serde_decimal")]
    pub earnings: U256,
    /// Whether the member currently receives revenue distributions.
    pub active: bool,
    /// Optional display name carried through from the join message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Member {
    /// New active member with zero earnings.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            earnings: U256::ZERO,
            active: true,
            name: None,
        }
    }

    /// Add a revenue share. Earnings only ever grow; a 256-bit overflow is
    /// reported rather than wrapped.
    pub fn add_revenue(&mut self, amount: U256) -> Result<()> {
        self.earnings = self.earnings.checked_add(amount).ok_or(Error::Overflow)?;
        Ok(())
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// EIP-55 checksummed rendering, the canonical external form.
    pub fn checksum_address(&self) -> String {
        self.address.to_checksum(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    #[test]
    fn new_member_is_active_with_zero_earnings() {
        let m = Member::new(addr(0xAA));
        assert!(m.active);
        assert_eq!(m.earnings, U256::ZERO);
        assert!(m.name.is_none());
    }

    #[test]
    fn add_revenue_accumulates() {
        let mut m = Member::new(addr(0x01));
        m.add_revenue(U256::from(100u64)).unwrap();
        m.add_revenue(U256::from(23u64)).unwrap();
        assert_eq!(m.earnings, U256::from(123u64));
    }

    #[test]
    fn add_revenue_overflow_is_an_error() {
        let mut m = Member::new(addr(0x01));
        m.earnings = U256::MAX;
        assert!(matches!(
            m.add_revenue(U256::from(1u64)),
            Err(Error::Overflow)
        ));
        // earnings untouched on failure
        assert_eq!(m.earnings, U256::MAX);
    }

    #[test]
    fn earnings_survive_deactivation() {
        let mut m = Member::new(addr(0x02));
        m.add_revenue(U256::from(55u64)).unwrap();
        m.set_active(false);
        assert_eq!(m.earnings, U256::from(55u64));
        m.set_active(true);
        assert_eq!(m.earnings, U256::from(55u64));
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let mut m = Member::new(addr(0x0F));
        // larger than u64 to prove no precision loss
        m.earnings = U256::from_str_radix("340282366920938463463374607431768211456", 10).unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(
            json["earnings"],
            "340282366920938463463374607431768211456"
        );
        let back: Member = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn parse_address_accepts_any_case_and_rejects_garbage() {
        let lower = parse_address("0x00000000000000000000000000000000000000aa").unwrap();
        let upper = parse_address("0x00000000000000000000000000000000000000AA").unwrap();
        assert_eq!(lower, upper);

        assert!(matches!(
            parse_address("not-an-address"),
            Err(Error::BadAddress(_))
        ));
        assert!(matches!(parse_address("0x1234"), Err(Error::BadAddress(_))));
    }

    #[test]
    fn checksum_rendering_matches_eip55() {
        // Known EIP-55 vector.
        let m = Member::new(parse_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed").unwrap());
        assert_eq!(
            m.checksum_address(),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }
}
