use serde::{de, Deserialize as _, Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

const NETWORK_KEY_SIZE: usize = 16;

/// The shared network key of the secure class. All zero until the inclusion
/// handshake delivers a real one.
#[derive(Serialize, Deserialize, Clone)]
pub struct NetworkKey(
    #[serde(serialize_with = "serialize_b64_key", deserialize_with = "deserialize_b64_key")]
    [u8; NETWORK_KEY_SIZE],
);

fn serialize_b64_key<S>(key: &[u8; NETWORK_KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&base64::encode(&key[..]))
}

fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; NETWORK_KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let decoded_raw = base64::decode(&s).map_err(de::Error::custom)?;

    if decoded_raw.len() != NETWORK_KEY_SIZE {
        return Err(de::Error::custom("Network key must be 16 bytes"));
    }

    let mut decoded = [0u8; NETWORK_KEY_SIZE];
    decoded.copy_from_slice(&decoded_raw);
    Ok(decoded)
}

impl NetworkKey {
    pub const SIZE: usize = NETWORK_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> NetworkKey {
        NetworkKey(key)
    }

    #[inline]
    pub fn zeroed() -> NetworkKey {
        NetworkKey([0u8; Self::SIZE])
    }

    /// True for the all-zero placeholder used outside the network.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }
}

impl Deref for NetworkKey {
    type Target = [u8; NetworkKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; NetworkKey::SIZE] {
        &self.0
    }
}

impl DerefMut for NetworkKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8; NetworkKey::SIZE] {
        &mut self.0
    }
}

/// Serial line settings. The wire is always 8N1; only the rate and the
/// write deadline vary by installation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PortConfig {
    pub baud: u32,
    pub write_timeout_ms: u64,
}

impl Default for PortConfig {
    fn default() -> PortConfig {
        PortConfig {
            baud: 115_200,
            write_timeout_ms: 250,
        }
    }
}

/// Per-state deadlines of the transmit state machine, in milliseconds.
/// Frequent listener targets get `freq_listener_extra_ms` on top.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StateTimeouts {
    pub ping_ack_ms: u64,
    pub ping_trans_ack_ms: u64,
    pub nonce_ack_ms: u64,
    pub nonce_trans_ack_ms: u64,
    pub nonce_ms: u64,
    pub ack_ms: u64,
    pub callback_ms: u64,
    pub freq_listener_extra_ms: u64,
}

impl Default for StateTimeouts {
    fn default() -> StateTimeouts {
        StateTimeouts {
            ping_ack_ms: 3000,
            ping_trans_ack_ms: 5000,
            nonce_ack_ms: 3000,
            nonce_trans_ack_ms: 5000,
            nonce_ms: 4000,
            ack_ms: 3000,
            callback_ms: 4000,
            freq_listener_extra_ms: 2000,
        }
    }
}

/// Everything tunable about the engine. The defaults are the values the
/// hardware was tuned against; installations override via the TOML file.
#[derive(Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    pub port: PortConfig,
    pub network_key: NetworkKey,
    pub timeouts: StateTimeouts,

    pub out_queue_bound: usize,
    pub in_queue_bound: usize,

    // Retry accounting: each failure class bumps the message cost by its
    // increment; crossing the limit aborts the message.
    pub retry_limit: u32,
    pub cancel_cost: u32,
    pub nak_cost: u32,
    pub timeout_cost: u32,

    // Inter-message throttling after failures
    pub cancel_backoff_ms: u64,
    pub failure_backoff_ms: u64,

    // Frequent listener ping suppression window
    pub ping_window_ms: u64,

    // Wire read pacing: the initial per-frame window and its one-shot
    // extension once a partial frame is in flight
    pub read_window_ms: u64,
    pub read_extend_ms: u64,
    pub idle_dequeue_ms: u64,

    pub nonce_ttl_in_secs: u64,
    pub nonce_ttl_out_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            port: PortConfig::default(),
            network_key: NetworkKey::zeroed(),
            timeouts: StateTimeouts::default(),
            out_queue_bound: 256,
            in_queue_bound: 128,
            retry_limit: 9,
            cancel_cost: 1,
            nak_cost: 2,
            timeout_cost: 3,
            cancel_backoff_ms: 100,
            failure_backoff_ms: 150,
            ping_window_ms: 1500,
            read_window_ms: 25,
            read_extend_ms: 100,
            idle_dequeue_ms: 15,
            nonce_ttl_in_secs: 10,
            nonce_ttl_out_secs: 5,
        }
    }
}

/// The external configuration collaborator. The engine reads the network
/// key once at start and writes it back when the inclusion handshake
/// delivers a new one.
pub trait ConfigStore: Send {
    fn load_network_key(&mut self) -> io::Result<NetworkKey>;
    fn store_network_key(&mut self, key: &NetworkKey) -> io::Result<()>;
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    network_key: NetworkKey,
}

/// File backed store, TOML like the rest of the configuration surface.
pub struct TomlStore {
    path: PathBuf,
}

impl TomlStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> TomlStore {
        TomlStore { path: path.into() }
    }
}

impl ConfigStore for TomlStore {
    fn load_network_key(&mut self) -> io::Result<NetworkKey> {
        if !self.path.exists() {
            return Ok(NetworkKey::zeroed());
        }

        let file: KeyFile = serdeconv::from_toml_file(&self.path)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        Ok(file.network_key)
    }

    fn store_network_key(&mut self, key: &NetworkKey) -> io::Result<()> {
        let file = KeyFile {
            network_key: key.clone(),
        };
        serdeconv::to_toml_file(&file, &self.path)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

/// In-memory store for tests and tools that have no persistence.
pub struct MemoryStore {
    key: NetworkKey,
}

impl MemoryStore {
    pub fn new(key: NetworkKey) -> MemoryStore {
        MemoryStore { key }
    }
}

impl ConfigStore for MemoryStore {
    fn load_network_key(&mut self) -> io::Result<NetworkKey> {
        Ok(self.key.clone())
    }

    fn store_network_key(&mut self, key: &NetworkKey) -> io::Result<()> {
        self.key = key.clone();
        Ok(())
    }
}
