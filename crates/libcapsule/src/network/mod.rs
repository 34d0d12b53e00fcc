//! Bridge backed virtual networks: CIDR pools, persisted network
//! definitions, and endpoints plumbed into container network namespaces.
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod bridge;
mod ipam;

pub use bridge::BridgeDriver;
pub use ipam::IpAllocator;

use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no free ip address in range")]
    NoFreeIp,
    #[error("network {0} does not exist")]
    NetworkNotExists(String),
    #[error("network {0} already exists")]
    NetworkExists(String),
    #[error("invalid cidr {0:?}")]
    InvalidCidr(String),
    #[error("cidr {0} has no usable host addresses")]
    NoUsableHosts(Cidr),
    #[error("address {0} is outside of range {1}")]
    AddressOutOfRange(Ipv4Addr, Cidr),
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },
    #[error("failed to parse address of interface {0}")]
    ParseInterface(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode network definition")]
    Encode(#[source] serde_json::Error),
    #[error("failed to parse network definition")]
    Decode(#[source] serde_json::Error),
}

type Result<T> = std::result::Result<T, NetworkError>;

/// An IPv4 range in CIDR notation. Serialized as the usual
/// `address/prefix` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(NetworkError::InvalidCidr(format!("{address}/{prefix}")));
        }
        let mask = prefix_mask(prefix);
        let network = Ipv4Addr::from(u32::from(address) & mask);
        let cidr = Self { network, prefix };
        if cidr.host_count() == 0 {
            return Err(NetworkError::NoUsableHosts(cidr));
        }
        Ok(cidr)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    fn first_host_u32(&self) -> u32 {
        u32::from(self.network) + 1
    }

    fn last_host_u32(&self) -> u32 {
        let broadcast = u32::from(self.network) | !prefix_mask(self.prefix);
        broadcast - 1
    }

    /// First usable host address; the gateway of a bridge network.
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.first_host_u32())
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> u32 {
        let first = self.first_host_u32();
        let last = self.last_host_u32();
        if last < first {
            0
        } else {
            last - first + 1
        }
    }

    /// Host address at `index`, counting from the first usable one.
    pub fn host_at(&self, index: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.first_host_u32() + index)
    }

    /// Index of `ip` within the usable host range, if it is in range.
    pub fn host_index(&self, ip: Ipv4Addr) -> Option<u32> {
        let value = u32::from(ip);
        if value < self.first_host_u32() || value > self.last_host_u32() {
            return None;
        }
        Some(value - self.first_host_u32())
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        (!0u32) << (32 - prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidCidr(s.to_owned()))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| NetworkError::InvalidCidr(s.to_owned()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| NetworkError::InvalidCidr(s.to_owned()))?;
        Cidr::new(address, prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cidr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A virtual network, persisted at `{runtime_root}/networks/{name}.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub ip_range: Cidr,
    pub driver: String,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl FromStr for PortMapping {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, container) = s
            .split_once(':')
            .ok_or_else(|| format!("port mapping {s:?} is not host:container"))?;
        Ok(PortMapping {
            host_port: host.parse().map_err(|_| format!("bad host port in {s:?}"))?,
            container_port: container
                .parse()
                .map_err(|_| format!("bad container port in {s:?}"))?,
        })
    }
}

/// The container side half of a network attachment. Owned by the container
/// and released when it is destroyed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub network: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

/// Store of network definitions and allocator bitmaps under
/// `{runtime_root}/networks/`.
pub struct NetworkStore {
    networks_dir: PathBuf,
}

impl NetworkStore {
    pub fn new(runtime_root: &Path) -> Result<Self> {
        let networks_dir = runtime_root.join("networks");
        utils::create_dir_all_with_mode(&networks_dir, 0o700)?;
        Ok(Self { networks_dir })
    }

    fn definition_path(&self, name: &str) -> PathBuf {
        self.networks_dir.join(format!("{name}.json"))
    }

    fn bitmap_path(&self, name: &str) -> PathBuf {
        self.networks_dir.join(format!("{name}.bitmap"))
    }

    pub fn allocator(&self, network: &Network) -> Result<IpAllocator> {
        IpAllocator::load(network.ip_range.clone(), self.bitmap_path(&network.name))
    }

    /// Creates a bridge network: reserves the gateway address out of the
    /// pool, creates the bridge with it, and persists the definition.
    pub fn create(&self, name: &str, subnet: &str) -> Result<Network> {
        if self.definition_path(name).exists() {
            return Err(NetworkError::NetworkExists(name.to_owned()));
        }
        let ip_range = Cidr::from_str(subnet)?;
        let network = Network {
            name: name.to_owned(),
            ip_range: ip_range.clone(),
            driver: BridgeDriver::NAME.to_owned(),
        };

        let allocator = self.allocator(&network)?;
        let gateway = allocator.allocate()?;

        if let Err(err) = BridgeDriver::create(name, &ip_range, gateway) {
            // hand the gateway back; the definition was never written
            if let Err(release_err) = allocator.release(gateway) {
                tracing::warn!(%release_err, "failed to release gateway after bridge create error");
            }
            return Err(err);
        }

        self.save(&network)?;
        tracing::info!(name, %ip_range, %gateway, "created network");
        Ok(network)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let network = self.load(name)?;
        BridgeDriver::delete(&network.name, &network.ip_range)?;
        fs::remove_file(self.definition_path(name))?;
        let bitmap = self.bitmap_path(name);
        if bitmap.exists() {
            fs::remove_file(bitmap)?;
        }
        tracing::info!(name, "deleted network");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Network> {
        let path = self.definition_path(name);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(NetworkError::NetworkNotExists(name.to_owned()))
            }
            Err(err) => return Err(NetworkError::Io(err)),
        };
        serde_json::from_slice(&content).map_err(NetworkError::Decode)
    }

    pub fn list(&self) -> Result<Vec<Network>> {
        let mut networks = Vec::new();
        for entry in fs::read_dir(&self.networks_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path)?;
            networks.push(serde_json::from_slice(&content).map_err(NetworkError::Decode)?);
        }
        networks.sort_by(|a: &Network, b: &Network| a.name.cmp(&b.name));
        Ok(networks)
    }

    fn save(&self, network: &Network) -> Result<()> {
        let content = serde_json::to_vec(network).map_err(NetworkError::Encode)?;
        utils::atomic_write(&self.definition_path(&network.name), &content)?;
        Ok(())
    }

    /// Attaches a container to a network: allocates an address and plumbs a
    /// veth pair into the init process's network namespace.
    pub fn connect(
        &self,
        endpoint_id: &str,
        network_name: &str,
        port_mappings: Vec<PortMapping>,
        init_pid: i32,
    ) -> Result<Endpoint> {
        let network = self.load(network_name)?;
        let allocator = self.allocator(&network)?;
        let ip = allocator.allocate()?;

        let endpoint = Endpoint {
            id: endpoint_id.to_owned(),
            network: network_name.to_owned(),
            ip,
            port_mappings,
        };

        if let Err(err) = BridgeDriver::connect(&network, &endpoint, init_pid) {
            if let Err(release_err) = allocator.release(ip) {
                tracing::warn!(%release_err, "failed to release ip after connect error");
            }
            return Err(err);
        }
        tracing::info!(endpoint_id, network_name, %ip, "connected endpoint");
        Ok(endpoint)
    }

    /// Reverses `connect`: removes the NAT rules and the veth pair, then
    /// returns the address to the pool.
    pub fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let network = self.load(&endpoint.network)?;
        BridgeDriver::disconnect(&network, endpoint)?;
        self.allocator(&network)?.release(endpoint.ip)?;
        tracing::info!(endpoint_id = %endpoint.id, "disconnected endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_display() {
        let cidr = Cidr::from_str("192.168.1.2/24").unwrap();
        // the network address is normalized
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
        assert_eq!(cidr.first_host(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(cidr.host_count(), 254);
    }

    #[test]
    fn test_cidr_small_range() {
        let cidr = Cidr::from_str("10.0.0.0/30").unwrap();
        assert_eq!(cidr.host_count(), 2);
        assert_eq!(cidr.host_at(0), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(cidr.host_at(1), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cidr.host_index(Ipv4Addr::new(10, 0, 0, 2)), Some(1));
        assert_eq!(cidr.host_index(Ipv4Addr::new(10, 0, 0, 3)), None);
    }

    #[test]
    fn test_cidr_rejects_invalid() {
        assert!(Cidr::from_str("10.0.0.0").is_err());
        assert!(Cidr::from_str("10.0.0.0/33").is_err());
        assert!(Cidr::from_str("10.0.0.0/32").is_err());
        assert!(Cidr::from_str("banana/24").is_err());
    }

    #[test]
    fn test_cidr_serde_round_trip() {
        let cidr = Cidr::from_str("172.18.0.0/16").unwrap();
        let encoded = serde_json::to_string(&cidr).unwrap();
        assert_eq!(encoded, "\"172.18.0.0/16\"");
        let decoded: Cidr = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cidr);
    }

    #[test]
    fn test_port_mapping_parse() {
        let mapping = PortMapping::from_str("8080:80").unwrap();
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.container_port, 80);
        assert!(PortMapping::from_str("8080").is_err());
        assert!(PortMapping::from_str("x:80").is_err());
    }

    #[test]
    fn test_store_load_missing_network() {
        let dir = tempfile::tempdir().unwrap();
        let store = NetworkStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("absent"),
            Err(NetworkError::NetworkNotExists(_))
        ));
    }
}
