use crate::registers::BitField;
use std::collections::BTreeMap;

/// Named boolean flags decoded out of one or more status registers.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct BitFields(BTreeMap<&'static str, bool>);

impl BitFields {
    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Names of the flags that are currently raised.
    pub fn active(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.iter().filter_map(|(k, v)| v.then_some(k))
    }

    fn merge(&mut self, other: BitFields) {
        for (name, value) in other.0 {
            let previous = self.0.insert(name, value);
            debug_assert!(previous.is_none(), "field {name} decoded twice");
        }
    }
}

/// Decode `value` according to `names`, where `names[i]` describes bit `i`.
///
/// Reserved bits (`None`) are skipped but still consume their position.
pub fn decode(names: &[Option<&'static str>], value: u16) -> BitFields {
    let mut result = BTreeMap::new();
    let mut value = value;
    for name in names.iter().take(16) {
        if let Some(name) = name {
            result.insert(*name, value & 1 != 0);
        }
        value >>= 1;
    }
    BitFields(result)
}

/// Decode every bit field in `fields` out of the registers of one group and merge the results.
///
/// Returns `None` if one of the fields refers to a register outside of `registers`.
pub fn decode_fields(fields: &[BitField], registers: &[u16]) -> Option<BitFields> {
    let mut result = BitFields::default();
    for field in fields {
        let value = *registers.get(usize::from(field.offset))?;
        result.merge(decode(field.names, value));
    }
    Some(result)
}
