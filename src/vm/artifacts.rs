//! The three artifacts that give a guest a stable identity across restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Opaque platform identity of the guest.
///
/// The serialized form is kept verbatim so a loaded identifier hands back
/// exactly the bytes that were persisted at install time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentifier {
    id: Uuid,
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Representation {
    identifier: Uuid,
}

impl MachineIdentifier {
    pub fn generate() -> Self {
        let id = Uuid::new_v4();
        // Serializing a struct holding only a Uuid cannot fail.
        let data = serde_json::to_vec(&Representation { identifier: id }).unwrap_or_default();
        Self { id, data }
    }

    /// Parse a persisted representation. The error is a human-readable reason.
    pub fn from_data_representation(data: &[u8]) -> Result<Self, String> {
        if data.is_empty() {
            return Err("empty identifier".into());
        }
        let repr: Representation =
            serde_json::from_slice(data).map_err(|e| format!("malformed identifier: {e}"))?;
        if repr.identifier.is_nil() {
            return Err("nil identifier".into());
        }
        Ok(Self {
            id: repr.identifier,
            data: data.to_vec(),
        })
    }

    pub fn data_representation(&self) -> &[u8] {
        &self.data
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }
}

impl Serialize for MachineIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

/// Handle to the persisted EFI variable store.
///
/// A freshly created store is empty; `fresh` tells the hypervisor to
/// initialise it on first boot instead of reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareVariableStore {
    pub path: PathBuf,
    pub fresh: bool,
}

/// Raw disk image backing the guest's primary disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// `false` when the image already existed and creation was a no-op.
    pub created: bool,
}

impl DiskImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identifiers_are_unique() {
        let a = MachineIdentifier::generate();
        let b = MachineIdentifier::generate();
        assert_ne!(a, b);
        assert_ne!(a.data_representation(), b.data_representation());
    }

    #[test]
    fn parsing_keeps_the_exact_bytes() {
        let original = MachineIdentifier::generate();
        let parsed = MachineIdentifier::from_data_representation(original.data_representation()).unwrap();
        assert_eq!(parsed.uuid(), original.uuid());
        assert_eq!(parsed.data_representation(), original.data_representation());
    }

    #[test]
    fn rejects_garbage() {
        assert!(MachineIdentifier::from_data_representation(b"").is_err());
        assert!(MachineIdentifier::from_data_representation(b"\x00\x01\x02").is_err());
        assert!(MachineIdentifier::from_data_representation(b"{\"identifier\":\"not-a-uuid\"}").is_err());
        assert!(
            MachineIdentifier::from_data_representation(
                b"{\"identifier\":\"00000000-0000-0000-0000-000000000000\"}"
            )
            .is_err()
        );
    }

    #[test]
    fn serializes_as_bare_uuid() {
        let id = MachineIdentifier::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.uuid()));
    }
}
