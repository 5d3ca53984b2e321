use crate::SegmentError;
use ph::fmph::Function;
use serde::{
    de::Error as DeError, ser::Error as SerError, Deserialize, Deserializer, Serialize, Serializer,
};

/// Salted minimal perfect hashing function for the key set of a segment.
///
/// The accessor salt is mixed into every key before hashing, so two nodes building accessors
/// over identical key sets still end up with distinct functions. Querying a key **not** present
/// in the original set returns an arbitrary index, so retrieval must verify the keyed word.
pub struct Fmph {
    salt: u32,
    function: Option<Function>,
}

impl Fmph {
    pub const fn new(salt: u32) -> Self {
        Self { salt, function: None }
    }

    pub const fn salt(&self) -> u32 {
        self.salt
    }

    /// Builds the function over the given key set.
    pub fn set_keys(&mut self, keys: &[Vec<u8>]) -> Result<(), SegmentError> {
        let salted: Vec<Vec<u8>> = keys.iter().map(|key| self.salted(key)).collect();
        self.function = Some(Function::from(&salted[..]));
        Ok(())
    }

    /// Returns the index of the key inside the hashed set. A function built over an empty key
    /// set maps everything to `None`.
    pub fn get_index(&self, key: &[u8]) -> Result<Option<u64>, SegmentError> {
        match self.function.as_ref() {
            Some(function) => Ok(function.get(&self.salted(key))),
            None => Ok(None),
        }
    }

    fn salted(&self, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + key.len());
        buf.extend_from_slice(&self.salt.to_be_bytes());
        buf.extend_from_slice(key);
        buf
    }
}

impl Serialize for Fmph {
    /// Serializes the salt and the function as a byte blob, since [`Function`] carries its own
    /// wire format.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = match &self.function {
            Some(function) => {
                let mut buf = Vec::with_capacity(function.write_bytes());
                function.write(&mut buf).map_err(S::Error::custom)?;
                Some(buf)
            }
            None => None,
        };
        (self.salt, bytes).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fmph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (salt, bytes) = <(u32, Option<Vec<u8>>)>::deserialize(deserializer)?;
        let function = match bytes {
            Some(buf) => {
                Some(Function::read(&mut buf.as_slice()).map_err(D::Error::custom)?)
            }
            None => None,
        };
        Ok(Self { salt, function })
    }
}

impl std::fmt::Debug for Fmph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fmph")
            .field("salt", &self.salt)
            .field("function.is_some()", &self.function.is_some())
            .finish()
    }
}

impl PartialEq for Fmph {
    fn eq(&self, other: &Self) -> bool {
        self.salt == other.salt && self.function.is_some() == other.function.is_some()
    }
}
