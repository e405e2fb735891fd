//! Versioned snapshot of every live pod, written on each change and read back
//! when the agent restarts.
//!
//! Layout: big-endian `u32` version, `u32` record count, then the records.
//! Strings and lists carry a `u16` length, addresses a family byte (4 or 6)
//! and prefixes an extra length byte. Fields follow the declaration order of
//! [`PodNetworkSpec`]; any change to them must bump [`STATE_FILE_VERSION`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::dataplane::{IpProto, PortRange};
use crate::pod::{HostPortBinding, InterfaceSpec, InterfaceType, PodNetworkSpec};
use crate::{Error, Result};

pub const STATE_FILE_VERSION: u32 = 2;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    fn len(&mut self, len: usize, what: &str) -> Result<()> {
        let len = u16::try_from(len).map_err(|_| {
            Error::StateEncode(format!("{what} has {len} entries, limit is {}", u16::MAX))
        })?;
        self.buf.put_u16(len);
        Ok(())
    }

    fn str(&mut self, s: &str, what: &str) -> Result<()> {
        self.len(s.len(), what)?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn bool(&mut self, b: bool) {
        self.buf.put_u8(b as u8);
    }

    fn ip(&mut self, ip: &IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.buf.put_u8(FAMILY_V4);
                self.buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.buf.put_u8(FAMILY_V6);
                self.buf.put_slice(&v6.octets());
            }
        }
    }

    fn net(&mut self, net: &IpNetwork) {
        self.ip(&net.ip());
        self.buf.put_u8(net.prefix());
    }

    fn interface_spec(&mut self, spec: &InterfaceSpec) {
        self.buf.put_u32(spec.rx_queues);
        self.buf.put_u32(spec.tx_queues);
        self.buf.put_u32(spec.rx_queue_size);
        self.buf.put_u32(spec.tx_queue_size);
        self.bool(spec.is_l3);
    }

    fn host_port(&mut self, hp: &HostPortBinding) {
        self.buf.put_u16(hp.host_port);
        self.bool(hp.host_ip4.is_some());
        if let Some(ip) = hp.host_ip4 {
            self.buf.put_slice(&ip.octets());
        }
        self.bool(hp.host_ip6.is_some());
        if let Some(ip) = hp.host_ip6 {
            self.buf.put_slice(&ip.octets());
        }
        self.buf.put_u16(hp.container_port);
        self.buf.put_u32(hp.entry_id);
        self.buf.put_u8(hp.protocol as u8);
    }

    fn spec(&mut self, spec: &PodNetworkSpec) -> Result<()> {
        self.str(&spec.interface_name, "interface name")?;
        self.str(&spec.netns_name, "netns name")?;
        self.bool(spec.allow_ip_forwarding);
        self.len(spec.routes.len(), "routes")?;
        spec.routes.iter().for_each(|r| self.net(r));
        self.len(spec.container_ips.len(), "container ips")?;
        spec.container_ips.iter().for_each(|ip| self.ip(ip));
        self.buf.put_u32(spec.mtu);

        self.str(&spec.orchestrator_id, "orchestrator id")?;
        self.str(&spec.workload_id, "workload id")?;
        self.str(&spec.endpoint_id, "endpoint id")?;
        self.len(spec.host_ports.len(), "host ports")?;
        spec.host_ports.iter().for_each(|hp| self.host_port(hp));

        self.len(spec.if_port_configs.len(), "port configs")?;
        for pc in &spec.if_port_configs {
            self.buf.put_u16(pc.start);
            self.buf.put_u16(pc.end);
            self.buf.put_u8(pc.proto as u8);
        }
        self.buf.put_u8(spec.port_filtered_if_type as u8);
        self.buf.put_u8(spec.default_if_type as u8);
        self.bool(spec.enable_vcl);
        self.bool(spec.enable_memif);

        self.interface_spec(&spec.if_spec);
        self.interface_spec(&spec.memif_spec);

        self.buf.put_u32(spec.memif_socket_id);
        self.buf.put_u32(spec.tun_tap_sw_if_index);
        self.buf.put_u32(spec.memif_sw_if_index);
        self.buf.put_u32(spec.loopback_sw_if_index);
        self.len(spec.port_filter_indexes.len(), "port filter indexes")?;
        spec.port_filter_indexes
            .iter()
            .for_each(|i| self.buf.put_u32(*i));

        self.buf.put_u32(spec.v4_vrf_id);
        self.buf.put_u32(spec.v6_vrf_id);
        self.bool(spec.needs_snat);

        self.bool(spec.network_name.is_some());
        if let Some(name) = &spec.network_name {
            self.str(name, "network name")?;
        }
        self.str(&spec.allowed_spoofing_prefixes, "allowed spoofing prefixes")?;

        self.buf.put_u32(spec.v4_rpf_vrf_id);
        self.buf.put_u32(spec.v6_rpf_vrf_id);
        self.len(spec.rpf_spoof_prefixes.len(), "rpf spoof prefixes")?;
        spec.rpf_spoof_prefixes.iter().for_each(|p| self.net(p));

        self.buf.put_u32(spec.v4_upstream_vrf_id);
        self.buf.put_u32(spec.v6_upstream_vrf_id);
        self.buf.put_u32(spec.v4_network_vrf_id);
        self.buf.put_u32(spec.v6_network_vrf_id);
        Ok(())
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl Decoder<'_> {
    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::StateDecode(format!(
                "truncated reading {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn bool(&mut self, what: &str) -> Result<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(Error::StateDecode(format!("invalid bool {b} for {what}"))),
        }
    }

    fn len(&mut self, what: &str) -> Result<usize> {
        Ok(self.u16(what)? as usize)
    }

    fn str(&mut self, what: &str) -> Result<String> {
        let len = self.len(what)?;
        self.need(len, what)?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|e| Error::StateDecode(format!("{what}: {e}")))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    fn v4(&mut self, what: &str) -> Result<Ipv4Addr> {
        self.need(4, what)?;
        let mut octets = [0u8; 4];
        self.buf.copy_to_slice(&mut octets);
        Ok(Ipv4Addr::from(octets))
    }

    fn v6(&mut self, what: &str) -> Result<Ipv6Addr> {
        self.need(16, what)?;
        let mut octets = [0u8; 16];
        self.buf.copy_to_slice(&mut octets);
        Ok(Ipv6Addr::from(octets))
    }

    fn ip(&mut self, what: &str) -> Result<IpAddr> {
        match self.u8(what)? {
            FAMILY_V4 => Ok(IpAddr::V4(self.v4(what)?)),
            FAMILY_V6 => Ok(IpAddr::V6(self.v6(what)?)),
            f => Err(Error::StateDecode(format!("unknown address family {f} for {what}"))),
        }
    }

    fn net(&mut self, what: &str) -> Result<IpNetwork> {
        let ip = self.ip(what)?;
        let prefix = self.u8(what)?;
        IpNetwork::new(ip, prefix).map_err(|e| Error::StateDecode(format!("{what}: {e}")))
    }

    fn list<T>(
        &mut self,
        what: &str,
        mut item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let len = self.len(what)?;
        (0..len).map(|_| item(self)).collect()
    }

    fn interface_spec(&mut self) -> Result<InterfaceSpec> {
        Ok(InterfaceSpec {
            rx_queues: self.u32("rx queues")?,
            tx_queues: self.u32("tx queues")?,
            rx_queue_size: self.u32("rx queue size")?,
            tx_queue_size: self.u32("tx queue size")?,
            is_l3: self.bool("is l3")?,
        })
    }

    fn host_port(&mut self) -> Result<HostPortBinding> {
        let host_port = self.u16("host port")?;
        let host_ip4 = match self.bool("host ip4")? {
            true => Some(self.v4("host ip4")?),
            false => None,
        };
        let host_ip6 = match self.bool("host ip6")? {
            true => Some(self.v6("host ip6")?),
            false => None,
        };
        Ok(HostPortBinding {
            host_port,
            host_ip4,
            host_ip6,
            container_port: self.u16("container port")?,
            entry_id: self.u32("entry id")?,
            protocol: IpProto::try_from(self.u8("protocol")?)?,
        })
    }

    fn port_range(&mut self) -> Result<PortRange> {
        Ok(PortRange {
            start: self.u16("port range start")?,
            end: self.u16("port range end")?,
            proto: IpProto::try_from(self.u8("port range protocol")?)?,
        })
    }

    fn spec(&mut self) -> Result<PodNetworkSpec> {
        Ok(PodNetworkSpec {
            interface_name: self.str("interface name")?,
            netns_name: self.str("netns name")?,
            allow_ip_forwarding: self.bool("allow ip forwarding")?,
            routes: self.list("routes", |d| d.net("route"))?,
            container_ips: self.list("container ips", |d| d.ip("container ip"))?,
            mtu: self.u32("mtu")?,
            orchestrator_id: self.str("orchestrator id")?,
            workload_id: self.str("workload id")?,
            endpoint_id: self.str("endpoint id")?,
            host_ports: self.list("host ports", Self::host_port)?,
            if_port_configs: self.list("port configs", Self::port_range)?,
            port_filtered_if_type: InterfaceType::try_from(self.u8("port filtered if type")?)?,
            default_if_type: InterfaceType::try_from(self.u8("default if type")?)?,
            enable_vcl: self.bool("enable vcl")?,
            enable_memif: self.bool("enable memif")?,
            if_spec: self.interface_spec()?,
            memif_spec: self.interface_spec()?,
            memif_socket_id: self.u32("memif socket id")?,
            tun_tap_sw_if_index: self.u32("tun/tap sw_if_index")?,
            memif_sw_if_index: self.u32("memif sw_if_index")?,
            loopback_sw_if_index: self.u32("loopback sw_if_index")?,
            port_filter_indexes: self.list("port filter indexes", |d| d.u32("index"))?,
            v4_vrf_id: self.u32("v4 vrf id")?,
            v6_vrf_id: self.u32("v6 vrf id")?,
            needs_snat: self.bool("needs snat")?,
            network_name: match self.bool("network name")? {
                true => Some(self.str("network name")?),
                false => None,
            },
            allowed_spoofing_prefixes: self.str("allowed spoofing prefixes")?,
            v4_rpf_vrf_id: self.u32("v4 rpf vrf id")?,
            v6_rpf_vrf_id: self.u32("v6 rpf vrf id")?,
            rpf_spoof_prefixes: self.list("rpf spoof prefixes", |d| d.net("rpf spoof prefix"))?,
            v4_upstream_vrf_id: self.u32("v4 upstream vrf id")?,
            v6_upstream_vrf_id: self.u32("v6 upstream vrf id")?,
            v4_network_vrf_id: self.u32("v4 network vrf id")?,
            v6_network_vrf_id: self.u32("v6 network vrf id")?,
        })
    }
}

pub fn encode<'a>(specs: impl IntoIterator<Item = &'a PodNetworkSpec>) -> Result<Vec<u8>> {
    let specs: Vec<&PodNetworkSpec> = specs.into_iter().collect();
    let count = u32::try_from(specs.len())
        .map_err(|_| Error::StateEncode(format!("{} records", specs.len())))?;
    let mut enc = Encoder {
        buf: BytesMut::with_capacity(8 + specs.len() * 256),
    };
    enc.buf.put_u32(STATE_FILE_VERSION);
    enc.buf.put_u32(count);
    for spec in specs {
        enc.spec(spec)?;
    }
    Ok(enc.buf.to_vec())
}

pub fn decode(data: &[u8]) -> Result<Vec<PodNetworkSpec>> {
    let mut dec = Decoder { buf: data };
    let version = dec.u32("version")?;
    if version != STATE_FILE_VERSION {
        return Err(Error::UnsupportedStateVersion {
            expected: STATE_FILE_VERSION,
            found: version,
        });
    }
    let count = dec.u32("record count")?;
    let mut specs = Vec::new();
    for _ in 0..count {
        specs.push(dec.spec()?);
    }
    if dec.buf.has_remaining() {
        return Err(Error::StateDecode(format!(
            "{} trailing bytes after {count} records",
            dec.buf.remaining()
        )));
    }
    Ok(specs)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push("~");
    PathBuf::from(tmp)
}

/// Replaces the file at `path` with a snapshot of `specs`. Readers see either
/// the previous snapshot or the new one.
pub fn save<'a>(specs: impl IntoIterator<Item = &'a PodNetworkSpec>, path: &Path) -> Result<()> {
    let data = encode(specs)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let tmp = tmp_path(path);
    if let Err(e) = write_synced(&tmp, &data).and_then(|()| fs::rename(&tmp, path)) {
        if let Err(rm) = fs::remove_file(&tmp)
            && rm.kind() != ErrorKind::NotFound
        {
            warn!(e = %rm, "failed to remove {}", tmp.display());
        }
        return Err(e.into());
    }
    // persist the directory entry of the rename
    File::open(dir)?.sync_all()?;
    debug!("saved {} bytes of pod state to {}", data.len(), path.display());
    Ok(())
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Reads the snapshot at `path`. A missing file is an empty snapshot.
pub fn load(path: &Path) -> Result<Vec<PodNetworkSpec>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("no pod state at {}, starting empty", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let specs = decode(&data)?;
    info!("loaded {} pods from {}", specs.len(), path.display());
    Ok(specs)
}
