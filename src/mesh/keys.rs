//! Key Manager
//!
//! Generates and rotates the per-member X25519 keypairs used by the
//! overlay protocol.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::mesh::Mesh;

/// X25519 keypair
pub struct KeyPair {
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from a base64-encoded private key
    pub fn from_private_base64(b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| Error::InvalidArgument(format!("private key is not base64: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::InvalidArgument(format!("invalid private key length: {} (expected 32)", b.len()))
        })?;

        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Base64 encoding of the public key
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Base64 encoding of the private key
    pub fn private_key_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }
}

/// Stored key material for one mesh member
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKey {
    pub private_key: String,
    pub public_key: String,
}

impl From<KeyPair> for NodeKey {
    fn from(pair: KeyPair) -> Self {
        Self {
            private_key: pair.private_key_base64(),
            public_key: pair.public_key_base64(),
        }
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Key lifecycle for mesh members
pub struct KeyManager;

impl KeyManager {
    /// Generate a keypair for every member lacking one. Existing keys are
    /// never touched. Returns the number of keys generated.
    pub fn ensure_keys(mesh: &mut Mesh) -> usize {
        let mut generated = 0;
        for node_id in &mesh.node_ids {
            if !mesh.keys.contains_key(node_id) {
                mesh.keys.insert(node_id.clone(), KeyPair::generate().into());
                generated += 1;
            }
        }
        generated
    }

    /// Regenerate every member's keypair unconditionally
    pub fn rotate(mesh: &mut Mesh) {
        mesh.keys = mesh
            .node_ids
            .iter()
            .map(|id| (id.clone(), KeyPair::generate().into()))
            .collect();
    }

    /// Drop key material for nodes that are no longer members
    pub fn prune(mesh: &mut Mesh) -> usize {
        let before = mesh.keys.len();
        let members = mesh.node_ids.clone();
        mesh.keys.retain(|id, _| members.contains(id));
        before - mesh.keys.len()
    }
}

/// Validate a base64-encoded public key
pub fn validate_public_key(b64: &str) -> Result<()> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| Error::InvalidArgument(format!("public key is not base64: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidArgument(format!(
            "invalid public key length: {} (expected 32)",
            bytes.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MeshStatus, Topology, Transport};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn mesh(members: &[&str]) -> Mesh {
        Mesh {
            id: Uuid::new_v4(),
            name: "test".into(),
            topology: Topology::FullMesh,
            overlay_subnet: "10.88.0.0/24".parse().unwrap(),
            mtu: 1420,
            transport: Transport::Udp,
            port: 51820,
            node_ids: members.iter().map(|s| s.to_string()).collect(),
            lan_subnets: BTreeMap::new(),
            keys: BTreeMap::new(),
            status: MeshStatus::Pending,
            revision: 0,
            node_results: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_applied_at: None,
        }
    }

    #[test]
    fn test_private_key_round_trip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_private_base64(&pair.private_key_base64()).unwrap();
        assert_eq!(restored.public_key_base64(), pair.public_key_base64());
        assert!(validate_public_key(&pair.public_key_base64()).is_ok());
        assert!(KeyPair::from_private_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_ensure_keys_never_overwrites() {
        let mut mesh = mesh(&["a", "b"]);
        assert_eq!(KeyManager::ensure_keys(&mut mesh), 2);
        let before = mesh.keys.clone();

        mesh.node_ids.push("c".into());
        assert_eq!(KeyManager::ensure_keys(&mut mesh), 1);
        assert_eq!(mesh.keys["a"], before["a"]);
        assert_eq!(mesh.keys["b"], before["b"]);
        assert!(mesh.keys.contains_key("c"));
    }

    #[test]
    fn test_rotate_changes_every_key() {
        let mut mesh = mesh(&["a", "b", "c"]);
        KeyManager::ensure_keys(&mut mesh);
        let before = mesh.keys.clone();

        KeyManager::rotate(&mut mesh);
        for id in &mesh.node_ids {
            assert_ne!(mesh.keys[id].public_key, before[id].public_key);
        }
    }

    #[test]
    fn test_prune_and_redaction() {
        let mut mesh = mesh(&["a", "b"]);
        KeyManager::ensure_keys(&mut mesh);
        mesh.node_ids.retain(|id| id != "b");
        assert_eq!(KeyManager::prune(&mut mesh), 1);

        let debug = format!("{:?}", mesh.keys["a"]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&mesh.keys["a"].private_key));
    }
}
