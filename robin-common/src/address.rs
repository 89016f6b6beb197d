use std::{
    fmt::{Debug, Display},
    ops::{Deref, DerefMut},
};

use mailparse::{MailAddr, MailAddrList};
use serde::{de, Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address(pub MailAddr);

impl Address {
    /// The bare `local@domain` form usable in SMTP commands.
    ///
    /// Group addresses have no single mailbox and yield `None`.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        match &self.0 {
            MailAddr::Single(single) => Some(&single.addr),
            MailAddr::Group(_) => None,
        }
    }

    /// The domain part of the address, if any.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.email().and_then(|addr| addr.split('@').nth(1))
    }

    /// The local part of the address, if any.
    #[must_use]
    pub fn local_part(&self) -> Option<&str> {
        self.email().and_then(|addr| addr.split('@').next())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<MailAddr> for Address {
    fn from(value: MailAddr) -> Self {
        Self(value)
    }
}

impl Deref for Address {
    type Target = MailAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// An ordered list of addresses with set semantics on insertion: a duplicate
/// mailbox is dropped, the first occurrence keeps its position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressList(Vec<Address>);

impl AddressList {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends an address unless an equal mailbox is already present.
    ///
    /// Returns `true` if the address was inserted.
    pub fn insert(&mut self, address: Address) -> bool {
        let duplicate = match address.email() {
            Some(email) => self
                .0
                .iter()
                .any(|existing| existing.email() == Some(email)),
            None => self.0.contains(&address),
        };

        if duplicate {
            false
        } else {
            self.0.push(address);
            true
        }
    }

    /// Keeps only the addresses for which `keep` returns `true`, preserving
    /// order.
    pub fn retain<F: FnMut(&Address) -> bool>(&mut self, keep: F) {
        self.0.retain(keep);
    }
}

impl Display for AddressList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, addr) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            Display::fmt(addr, f)?;
        }
        Ok(())
    }
}

impl From<Vec<Address>> for AddressList {
    fn from(value: Vec<Address>) -> Self {
        let mut list = Self::new();
        for address in value {
            list.insert(address);
        }
        list
    }
}

impl From<MailAddrList> for AddressList {
    fn from(value: MailAddrList) -> Self {
        value
            .iter()
            .map(|a| Address(a.clone()))
            .collect::<Vec<_>>()
            .into()
    }
}

impl Deref for AddressList {
    type Target = Vec<Address>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let addr = match &self.0 {
            MailAddr::Group(group_info) => group_info.to_string(),
            MailAddr::Single(single_info) => single_info.to_string(),
        };
        serializer.serialize_str(addr.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Addr;

        impl de::Visitor<'_> for Addr {
            type Value = Address;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an email address")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                mailparse::addrparse(v)
                    .map(|mut a| a.remove(0))
                    .map(Address)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &Self))
            }
        }

        deserializer.deserialize_str(Addr)
    }
}

/// Parses a single forward/reverse path as used in MAIL FROM / RCPT TO.
///
/// # Errors
/// Returns the parse failure from `mailparse` if the input is not an address.
pub fn parse_one(input: &str) -> Result<Address, mailparse::MailParseError> {
    mailparse::addrparse(input).map(|mut list| Address(list.remove(0)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::{parse_one, AddressList};

    #[test]
    fn insert_dedupes_by_mailbox() {
        let mut list = AddressList::new();
        assert!(list.insert(parse_one("a@example.com").unwrap()));
        assert!(list.insert(parse_one("b@example.com").unwrap()));
        assert!(!list.insert(parse_one("a@example.com").unwrap()));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].email(), Some("a@example.com"));
    }

    #[test]
    fn domain_and_local_part() {
        let addr = parse_one("user@example.com").unwrap();
        assert_eq!(addr.domain(), Some("example.com"));
        assert_eq!(addr.local_part(), Some("user"));
    }

    #[test]
    fn retain_preserves_order() {
        let mut list = AddressList::new();
        list.insert(parse_one("a@example.com").unwrap());
        list.insert(parse_one("b@example.com").unwrap());
        list.insert(parse_one("c@example.com").unwrap());

        list.retain(|addr| addr.email() != Some("b@example.com"));

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].email(), Some("a@example.com"));
        assert_eq!(list[1].email(), Some("c@example.com"));
    }
}
