//! Identity registry: local identities and their contacts
//!
//! Local identities are created through the key store and get one current
//! device id each. Contacts are public identities learned out of band,
//! scoped to the local identity that added them, with a trust level, the
//! devices seen so far and free-form metadata.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{DeviceId, IdentityId, PublicIdentity};
use crate::error::{EngineError, EngineResult};
use crate::keystore::KeyStore;
use crate::storage::{SealedStore, StorageError};

const LOCAL_NAMESPACE: &str = "identities";
const CONTACT_NAMESPACE: &str = "contacts";

/// How far a contact is trusted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Added but not verified out of band
    Unverified,
    /// Verified out of band
    Trusted,
    /// Explicitly revoked; no channels may be established
    Revoked,
}

/// One of our own identities
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Public keys
    pub public: PublicIdentity,
    /// This installation's device
    pub device: DeviceId,
    /// Creation time (seconds since the Unix epoch)
    pub created_at: u64,
    /// Application-defined metadata
    pub metadata: BTreeMap<String, String>,
}

impl LocalIdentity {
    /// Identifier
    pub fn id(&self) -> IdentityId {
        self.public.id()
    }
}

/// A remote identity known to one local identity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Local identity that owns this contact entry
    pub owner: IdentityId,
    /// Remote public keys
    pub public: PublicIdentity,
    /// Trust level
    pub trust: TrustLevel,
    /// Devices known for this contact
    pub devices: BTreeSet<DeviceId>,
    /// Application-defined metadata
    pub metadata: BTreeMap<String, String>,
    /// When the contact was added (seconds since the Unix epoch)
    pub added_at: u64,
}

impl Contact {
    /// Identifier of the remote identity
    pub fn id(&self) -> IdentityId {
        self.public.id()
    }
}

type ContactKey = (IdentityId, IdentityId);

/// Registry of local identities and contacts.
///
/// An outer lock guards the maps; each entry has its own lock, so updates
/// to different entries never wait on each other.
pub struct IdentityRegistry {
    keystore: Arc<KeyStore>,
    store: SealedStore,
    locals: RwLock<HashMap<IdentityId, Arc<Mutex<LocalIdentity>>>>,
    contacts: RwLock<HashMap<ContactKey, Arc<Mutex<Contact>>>>,
}

impl IdentityRegistry {
    /// Open a registry, loading all persisted entries
    pub fn open(keystore: Arc<KeyStore>, store: SealedStore) -> EngineResult<Self> {
        let mut locals = HashMap::new();
        for name in store.list(LOCAL_NAMESPACE)? {
            match store.get::<LocalIdentity>(LOCAL_NAMESPACE, &name) {
                Ok(Some(local)) => {
                    locals.insert(local.id(), Arc::new(Mutex::new(local)));
                }
                Ok(None) => {}
                Err(StorageError::Corrupted { .. }) => {
                    return Err(EngineError::CorruptedIdentity(name));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut contacts = HashMap::new();
        for name in store.list(CONTACT_NAMESPACE)? {
            match store.get::<Contact>(CONTACT_NAMESPACE, &name) {
                Ok(Some(contact)) => {
                    contacts.insert((contact.owner, contact.id()), Arc::new(Mutex::new(contact)));
                }
                Ok(None) => {}
                Err(StorageError::Corrupted { .. }) => {
                    warn!(record = %name, "Dropping unreadable contact record");
                    store.delete(CONTACT_NAMESPACE, &name)?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            identities = locals.len(),
            contacts = contacts.len(),
            "Opened identity registry"
        );
        Ok(IdentityRegistry {
            keystore,
            store,
            locals: RwLock::new(locals),
            contacts: RwLock::new(contacts),
        })
    }

    /// Key store backing the local identities
    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.keystore
    }

    /// Generate a new local identity with a fresh device id
    pub fn create_identity(&self) -> EngineResult<LocalIdentity> {
        let public = self.keystore.generate_identity()?;
        let local = LocalIdentity {
            public,
            device: DeviceId::generate().map_err(|e| EngineError::KeyGeneration(e.to_string()))?,
            created_at: unix_now(),
            metadata: BTreeMap::new(),
        };

        self.store.put(LOCAL_NAMESPACE, &local.id().to_hex(), &local)?;
        self.locals
            .write()
            .insert(local.id(), Arc::new(Mutex::new(local.clone())));
        info!(identity = %local.id().short(), device = %local.device, "Created local identity");
        Ok(local)
    }

    /// Look up a local identity
    pub fn local_identity(&self, id: &IdentityId) -> EngineResult<LocalIdentity> {
        self.locals
            .read()
            .get(id)
            .map(|entry| entry.lock().clone())
            .ok_or_else(|| EngineError::NotFound(format!("local identity {}", id.short())))
    }

    /// All local identities
    pub fn local_identities(&self) -> Vec<LocalIdentity> {
        let mut all: Vec<_> = self
            .locals
            .read()
            .values()
            .map(|entry| entry.lock().clone())
            .collect();
        all.sort_by_key(|local| local.created_at);
        all
    }

    /// Set a metadata entry on a local identity
    pub fn set_identity_metadata(
        &self,
        id: &IdentityId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> EngineResult<()> {
        let entry = self
            .locals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("local identity {}", id.short())))?;
        let mut local = entry.lock();
        local.metadata.insert(key.into(), value.into());
        self.store.put(LOCAL_NAMESPACE, &id.to_hex(), &*local)?;
        Ok(())
    }

    /// Delete a local identity, its keys and every contact it owns
    pub fn delete_identity(&self, id: &IdentityId) -> EngineResult<()> {
        if self.locals.write().remove(id).is_none() {
            return Err(EngineError::NotFound(format!("local identity {}", id.short())));
        }

        let owned: Vec<ContactKey> = self
            .contacts
            .read()
            .keys()
            .filter(|(owner, _)| owner == id)
            .copied()
            .collect();
        for key in owned {
            self.contacts.write().remove(&key);
            self.store.delete(CONTACT_NAMESPACE, &contact_name(&key))?;
        }

        self.store.delete(LOCAL_NAMESPACE, &id.to_hex())?;
        self.keystore.remove_identity(id)?;
        info!(identity = %id.short(), "Deleted local identity");
        Ok(())
    }

    /// Add a contact, or update the trust level of an existing one.
    ///
    /// Known devices and metadata of an existing contact are kept.
    pub fn add_contact(
        &self,
        owner: &IdentityId,
        public: PublicIdentity,
        trust: TrustLevel,
    ) -> EngineResult<Contact> {
        self.local_identity(owner)?;
        let key = (*owner, public.id());
        if key.0 == key.1 {
            return Err(EngineError::Protocol("cannot add an identity as its own contact".into()));
        }

        let existing = self.contacts.read().get(&key).cloned();
        let contact = match existing {
            Some(entry) => {
                let mut contact = entry.lock();
                contact.trust = trust;
                self.store.put(CONTACT_NAMESPACE, &contact_name(&key), &*contact)?;
                contact.clone()
            }
            None => {
                let contact = Contact {
                    owner: *owner,
                    public,
                    trust,
                    devices: BTreeSet::new(),
                    metadata: BTreeMap::new(),
                    added_at: unix_now(),
                };
                self.store.put(CONTACT_NAMESPACE, &contact_name(&key), &contact)?;
                self.contacts
                    .write()
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(contact.clone())));
                contact
            }
        };

        info!(
            owner = %owner.short(),
            contact = %key.1.short(),
            trust = ?trust,
            "Stored contact"
        );
        Ok(contact)
    }

    /// Look up a contact
    pub fn contact(&self, owner: &IdentityId, remote: &IdentityId) -> EngineResult<Contact> {
        Ok(self.contact_entry(owner, remote)?.lock().clone())
    }

    /// All contacts of a local identity
    pub fn contacts(&self, owner: &IdentityId) -> Vec<Contact> {
        let mut all: Vec<_> = self
            .contacts
            .read()
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|(_, entry)| entry.lock().clone())
            .collect();
        all.sort_by_key(|contact| contact.added_at);
        all
    }

    /// Change a contact's trust level
    pub fn set_trust(
        &self,
        owner: &IdentityId,
        remote: &IdentityId,
        trust: TrustLevel,
    ) -> EngineResult<()> {
        self.update_contact(owner, remote, |contact| contact.trust = trust)?;
        info!(owner = %owner.short(), contact = %remote.short(), trust = ?trust, "Trust changed");
        Ok(())
    }

    /// Record a device for a contact; returns whether it was new
    pub fn add_contact_device(
        &self,
        owner: &IdentityId,
        remote: &IdentityId,
        device: DeviceId,
    ) -> EngineResult<bool> {
        self.update_contact(owner, remote, |contact| contact.devices.insert(device))
    }

    /// Set a metadata entry on a contact
    pub fn set_contact_metadata(
        &self,
        owner: &IdentityId,
        remote: &IdentityId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> EngineResult<()> {
        let (key, value) = (key.into(), value.into());
        self.update_contact(owner, remote, |contact| {
            contact.metadata.insert(key, value);
        })
    }

    /// Remove a contact
    pub fn remove_contact(&self, owner: &IdentityId, remote: &IdentityId) -> EngineResult<()> {
        let key = (*owner, *remote);
        if self.contacts.write().remove(&key).is_none() {
            return Err(EngineError::NotFound(format!("contact {}", remote.short())));
        }
        self.store.delete(CONTACT_NAMESPACE, &contact_name(&key))?;
        info!(owner = %owner.short(), contact = %remote.short(), "Removed contact");
        Ok(())
    }

    fn contact_entry(
        &self,
        owner: &IdentityId,
        remote: &IdentityId,
    ) -> EngineResult<Arc<Mutex<Contact>>> {
        self.contacts
            .read()
            .get(&(*owner, *remote))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("contact {}", remote.short())))
    }

    fn update_contact<T>(
        &self,
        owner: &IdentityId,
        remote: &IdentityId,
        f: impl FnOnce(&mut Contact) -> T,
    ) -> EngineResult<T> {
        let entry = self.contact_entry(owner, remote)?;
        let mut contact = entry.lock();
        let out = f(&mut *contact);
        self.store
            .put(CONTACT_NAMESPACE, &contact_name(&(*owner, *remote)), &*contact)?;
        Ok(out)
    }
}

fn contact_name((owner, remote): &ContactKey) -> String {
    format!("{}-{}", owner.to_hex(), remote.to_hex())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
