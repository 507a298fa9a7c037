//! Network devices and raw capture handles.
//!
//! Device discovery combines libpcap's device list with the kernel's view of
//! hardware addresses and routes (`/sys/class/net`, `/proc/net/route`,
//! `/proc/net/arp`). A `RawConn` binds one device with a BPF filter and
//! exposes blocking frame reads and non-blocking frame injection.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use parking_lot::Mutex;
use pcap::{Active, Capture, Linktype};

use crate::error::{Error, Result};
use crate::packet::{HardwareAddr, LinkType};

/// Milliseconds a blocking read waits before yielding, so reader tasks can
/// observe the shutdown flag.
const READ_TIMEOUT_MS: i32 = 500;

/// A local network device eligible for capture or egress.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub hardware_addr: Option<HardwareAddr>,
    pub is_loopback: bool,
}

impl Device {
    /// The device's primary IPv4 address.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    /// Link-layer framing used on this device.
    pub fn link_type(&self) -> LinkType {
        if self.is_loopback {
            LinkType::Loopback
        } else {
            LinkType::Ethernet
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(mac) = self.hardware_addr {
            write!(f, " [{mac}]")?;
        }
        for addr in &self.addresses {
            write!(f, " {addr}")?;
        }
        Ok(())
    }
}

/// The next hop used for tunnel egress.
#[derive(Debug, Clone, Copy)]
pub struct Gateway {
    pub ip: Ipv4Addr,
    pub hardware_addr: HardwareAddr,
}

/// Enumerate all capturable devices.
pub fn list_devices() -> Result<Vec<Device>> {
    let devices = pcap::Device::list()?;

    Ok(devices
        .into_iter()
        .map(|dev| {
            let is_loopback = dev.flags.is_loopback();
            Device {
                hardware_addr: read_hardware_addr(&dev.name),
                addresses: dev.addresses.iter().map(|a| a.addr).collect(),
                name: dev.name,
                is_loopback,
            }
        })
        .collect())
}

/// Resolve the devices to capture on.
///
/// Named devices are matched exactly; with no names, every device that has
/// an address is eligible (the caller drops loopbacks by default).
pub fn find_listen_devices(names: &[String]) -> Result<Vec<Device>> {
    let all = list_devices()?;

    if names.is_empty() {
        return Ok(all.into_iter().filter(|d| !d.addresses.is_empty()).collect());
    }

    let mut result = Vec::with_capacity(names.len());
    for name in names {
        match all.iter().find(|d| &d.name == name) {
            Some(dev) => result.push(dev.clone()),
            None => return Err(Error::Config(format!("unknown listen device {name}"))),
        }
    }
    Ok(result)
}

/// Resolve the egress device, by name or from the default route.
pub fn find_upstream_device(name: Option<&str>) -> Result<Device> {
    let all = list_devices()?;

    if let Some(name) = name {
        return all
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::Config(format!("unknown upstream device {name}")));
    }

    let (route_dev, _) = default_route()
        .ok_or_else(|| Error::Config("cannot determine upstream device".into()))?;
    all.into_iter()
        .find(|d| d.name == route_dev)
        .ok_or_else(|| Error::Config(format!("upstream device {route_dev} not capturable")))
}

/// Resolve the gateway next hop for the upstream device.
pub fn find_gateway(device: &Device, configured: Option<Ipv4Addr>) -> Result<Gateway> {
    let ip = match configured {
        Some(ip) => ip,
        None => {
            let (route_dev, gw) = default_route()
                .ok_or_else(|| Error::Config("cannot determine gateway device".into()))?;
            if route_dev != device.name {
                return Err(Error::Config(format!(
                    "default route is via {route_dev}, not upstream device {}",
                    device.name
                )));
            }
            gw
        }
    };

    let hardware_addr = arp_lookup(ip).ok_or_else(|| {
        Error::Config(format!(
            "gateway {ip} has no ARP entry; ping it once and retry"
        ))
    })?;

    Ok(Gateway { ip, hardware_addr })
}

/// A bidirectional raw handle on one device, read-filtered by a BPF
/// expression.
///
/// Reads and writes go through separate pcap handles so a blocked reader
/// never delays injection.
pub struct RawConn {
    device: Device,
    link_type: LinkType,
    rx: Mutex<Capture<Active>>,
    tx: Mutex<Capture<Active>>,
}

impl RawConn {
    /// Open a device for filtered capture and injection.
    pub fn open(device: &Device, filter: &str) -> Result<Self> {
        let mut rx = Capture::from_device(device.name.as_str())?
            .promisc(true)
            .snaplen(65535)
            .immediate_mode(true)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        rx.filter(filter, true)?;

        let link_type = match rx.get_datalink() {
            Linktype::NULL | Linktype::LOOP => LinkType::Loopback,
            _ => LinkType::Ethernet,
        };

        let tx = Capture::from_device(device.name.as_str())?
            .promisc(false)
            .snaplen(65535)
            .open()?;

        Ok(Self {
            device: device.clone(),
            link_type,
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
        })
    }

    /// Read one captured frame. Returns `None` when the read timeout
    /// elapsed without traffic.
    pub fn read_frame(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock();
        match rx.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Inject one raw frame onto the device.
    pub fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut tx = self.tx.lock();
        tx.sendpacket(frame)?;
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn is_loopback(&self) -> bool {
        self.link_type == LinkType::Loopback
    }

    /// The device's own hardware address; all-zero on interfaces without
    /// one (loopback).
    pub fn local_hardware_addr(&self) -> HardwareAddr {
        self.device.hardware_addr.unwrap_or(HardwareAddr::ZERO)
    }
}

impl fmt::Debug for RawConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConn")
            .field("device", &self.device.name)
            .field("link_type", &self.link_type)
            .finish()
    }
}

/// Read a device's hardware address from sysfs.
#[cfg(target_os = "linux")]
fn read_hardware_addr(name: &str) -> Option<HardwareAddr> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/address")).ok()?;
    let addr = HardwareAddr::from_str(raw.trim()).ok()?;
    if addr == HardwareAddr::ZERO {
        None
    } else {
        Some(addr)
    }
}

#[cfg(not(target_os = "linux"))]
fn read_hardware_addr(_name: &str) -> Option<HardwareAddr> {
    None
}

/// The default route as (device name, gateway address).
#[cfg(target_os = "linux")]
fn default_route() -> Option<(String, Ipv4Addr)> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    parse_route_table(&table)
}

#[cfg(not(target_os = "linux"))]
fn default_route() -> Option<(String, Ipv4Addr)> {
    None
}

/// Resolve an IP to a hardware address through the kernel ARP cache.
#[cfg(target_os = "linux")]
fn arp_lookup(ip: Ipv4Addr) -> Option<HardwareAddr> {
    let table = std::fs::read_to_string("/proc/net/arp").ok()?;
    parse_arp_table(&table, ip)
}

#[cfg(not(target_os = "linux"))]
fn arp_lookup(_ip: Ipv4Addr) -> Option<HardwareAddr> {
    None
}

/// Parse `/proc/net/route` for the default gateway.
fn parse_route_table(table: &str) -> Option<(String, Ipv4Addr)> {
    const RTF_UP: u32 = 0x1;
    const RTF_GATEWAY: u32 = 0x2;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let destination = u32::from_str_radix(fields[1], 16).ok()?;
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let flags = u32::from_str_radix(fields[3], 16).ok()?;

        if destination == 0 && flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0 {
            // /proc/net/route stores addresses little-endian.
            let ip = Ipv4Addr::from(gateway.swap_bytes());
            return Some((fields[0].to_string(), ip));
        }
    }
    None
}

/// Parse `/proc/net/arp` for one address.
fn parse_arp_table(table: &str, ip: Ipv4Addr) -> Option<HardwareAddr> {
    let needle = ip.to_string();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != needle {
            continue;
        }
        let addr = HardwareAddr::from_str(fields[3]).ok()?;
        if addr == HardwareAddr::ZERO {
            return None;
        }
        return Some(addr);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_table() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t00000000\t0100A8C0\t0003\t0\t0\t100\t00000000\n\
                     eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";

        let (dev, gw) = parse_route_table(table).unwrap();
        assert_eq!(dev, "eth0");
        assert_eq!(gw, Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn test_parse_route_table_no_default() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert!(parse_route_table(table).is_none());
    }

    #[test]
    fn test_parse_arp_table() {
        let table = "IP address       HW type     Flags       HW address            Mask     Device\n\
                     192.168.0.1      0x1         0x2         f0:9f:c2:11:22:33     *        eth0\n\
                     192.168.0.7      0x1         0x0         00:00:00:00:00:00     *        eth0\n";

        assert_eq!(
            parse_arp_table(table, Ipv4Addr::new(192, 168, 0, 1)),
            Some("f0:9f:c2:11:22:33".parse().unwrap())
        );
        // Incomplete entries resolve to nothing.
        assert_eq!(parse_arp_table(table, Ipv4Addr::new(192, 168, 0, 7)), None);
        assert_eq!(parse_arp_table(table, Ipv4Addr::new(192, 168, 0, 9)), None);
    }

    #[test]
    fn test_device_display() {
        let device = Device {
            name: "eth0".into(),
            addresses: vec!["192.168.0.5".parse().unwrap()],
            hardware_addr: Some(HardwareAddr([0xaa; 6])),
            is_loopback: false,
        };
        assert_eq!(
            device.to_string(),
            "eth0 [aa:aa:aa:aa:aa:aa] 192.168.0.5"
        );
        assert_eq!(device.link_type(), LinkType::Ethernet);
    }
}
