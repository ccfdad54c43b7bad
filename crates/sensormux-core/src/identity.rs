// Copyright (c) 2025 the sensormux contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Anonymized dynamic-sensor identity.
//!
//! A dynamic sensor's hardware uuid must not be observable across apps, so
//! clients see a per-app id derived as `HMAC-SHA256(key, uuid || uid)`
//! truncated to 32 bits. The key is generated once and persisted with
//! owner-read-only permissions; losing it only means ids change across
//! reboots.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::sensor::SensorUuid;

pub const HMAC_KEY_LEN: usize = 128;
pub const HMAC_KEY_FILE_NAME: &str = "hmac_key";

#[derive(Debug)]
pub struct IdentityKey {
    key: Option<[u8; HMAC_KEY_LEN]>,
}

impl IdentityKey {
    /// Loads the key from `<dir>/hmac_key`, generating and persisting a new
    /// one when absent. A failure to persist is logged and tolerated; a
    /// failure to generate leaves the module disabled and every derived id
    /// zero.
    pub fn initialize(dir: &Path) -> Self {
        let path = dir.join(HMAC_KEY_FILE_NAME);
        if let Ok(bytes) = fs::read(&path) {
            if let Ok(key) = <[u8; HMAC_KEY_LEN]>::try_from(bytes.as_slice()) {
                return Self { key: Some(key) };
            }
            tracing::warn!(path = %path.display(), "unreadable hmac key; generating a new one");
        }

        let mut key = [0_u8; HMAC_KEY_LEN];
        rand::rng().fill_bytes(&mut key);

        if let Err(err) = persist_key(dir, &path, &key) {
            tracing::warn!(
                error = %err,
                path = %path.display(),
                "unable to persist hmac key; dynamic sensor ids will change after reboot"
            );
        } else {
            tracing::info!("generated new hmac key");
        }
        Self { key: Some(key) }
    }

    /// A key handed in directly, for embedding the module without a
    /// persistence directory.
    pub fn from_key(key: [u8; HMAC_KEY_LEN]) -> Self {
        Self { key: Some(key) }
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_valid(&self) -> bool {
        self.key.is_some()
    }

    /// Derives the per-app id for a sensor uuid.
    ///
    /// Zero and minus-one are reserved encodings (`0` = uuid unsupported,
    /// `-1` = identify by type and name) and are never produced for a real
    /// uuid; a derivation landing on one is nudged off it.
    pub fn id_from_uuid(&self, uuid: &SensorUuid, caller_uid: u32) -> i32 {
        if uuid.is_zero() {
            return 0;
        }
        if uuid.is_all_ones() {
            return -1;
        }
        let Some(key) = &self.key else {
            tracing::warn!("hmac key unavailable; dynamic sensor ids are degraded");
            return 0;
        };

        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) else {
            tracing::warn!("hmac init failure; dynamic sensor ids are degraded");
            return 0;
        };
        mac.update(&uuid.0);
        mac.update(&caller_uid.to_le_bytes());
        let digest = mac.finalize().into_bytes();

        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&digest[..4]);
        match i32::from_le_bytes(raw) {
            0 => 1,
            -1 => -2,
            id => id,
        }
    }
}

#[cfg(unix)]
fn persist_key(dir: &Path, path: &Path, key: &[u8; HMAC_KEY_LEN]) -> std::io::Result<()> {
    use std::fs::{DirBuilder, OpenOptions};
    use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    let mut file =
        OpenOptions::new().write(true).create_new(true).mode(0o400).open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn persist_key(dir: &Path, path: &Path, key: &[u8; HMAC_KEY_LEN]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(key)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn generates_and_persists_owner_read_only() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("svc");
        let _ = IdentityKey::initialize(&dir);
        let path = dir.join(HMAC_KEY_FILE_NAME);
        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.len(), HMAC_KEY_LEN as u64);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(metadata.permissions().mode() & 0o777, 0o400);
        }
    }

    #[test]
    fn ids_are_stable_across_reloads() {
        let tmp = TempDir::new().unwrap();
        let uuid = SensorUuid([0xAB; 16]);
        let first = IdentityKey::initialize(tmp.path()).id_from_uuid(&uuid, 10_123);
        let second = IdentityKey::initialize(tmp.path()).id_from_uuid(&uuid, 10_123);
        assert_eq!(first, second);
    }

    #[test]
    fn uuid_sentinels_pass_through() {
        let key = IdentityKey::from_key([7; HMAC_KEY_LEN]);
        assert_eq!(key.id_from_uuid(&SensorUuid::ZERO, 10_000), 0);
        assert_eq!(key.id_from_uuid(&SensorUuid::ALL_ONES, 10_000), -1);
    }

    #[test]
    fn disabled_key_degrades_to_zero() {
        let key = IdentityKey::disabled();
        assert_eq!(key.id_from_uuid(&SensorUuid([1; 16]), 10_000), 0);
    }

    #[test]
    fn id_depends_on_caller_uid() {
        let key = IdentityKey::from_key([7; HMAC_KEY_LEN]);
        let uuid = SensorUuid([0x42; 16]);
        assert_ne!(key.id_from_uuid(&uuid, 10_001), key.id_from_uuid(&uuid, 10_002));
    }

    proptest! {
        #[test]
        fn valid_uuids_never_map_to_sentinels(bytes in any::<[u8; 16]>(), uid in any::<u32>()) {
            prop_assume!(bytes.iter().any(|b| *b != 0));
            prop_assume!(bytes.iter().any(|b| *b != 0xFF));
            let key = IdentityKey::from_key([7; HMAC_KEY_LEN]);
            let id = key.id_from_uuid(&SensorUuid(bytes), uid);
            prop_assert_ne!(id, 0);
            prop_assert_ne!(id, -1);
        }

        #[test]
        fn derivation_is_deterministic(bytes in any::<[u8; 16]>(), uid in any::<u32>()) {
            let key = IdentityKey::from_key([9; HMAC_KEY_LEN]);
            let uuid = SensorUuid(bytes);
            prop_assert_eq!(key.id_from_uuid(&uuid, uid), key.id_from_uuid(&uuid, uid));
        }
    }
}
