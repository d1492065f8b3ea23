//! The typed control surface: interface administration commands.
//!
//! Equivalent to the classic control-device commands: bring an interface
//! up with addressing, take it down (with the attached discipline's
//! consent), and query interface information. Commands that name an
//! interface resolve it through the registry; the info query is
//! device-independent.

use std::sync::Arc;

use log::info;

use crate::device::{flags, Device};
use crate::error::{Error, Result};
use crate::wire::{EthernetAddress, Ipv4Address};
use crate::Stack;

/// The interface-administration request.
#[derive(Debug, Clone)]
pub struct CoreCmd {
    pub if_name: String,
    pub ip_addr: Ipv4Address,
    pub broadcast_ip: Ipv4Address,
    pub set_flags: u32,
    pub clear_flags: u32,
    pub hwaddr: Option<EthernetAddress>,
}

/// A snapshot of one interface's state.
#[derive(Debug, Clone)]
pub struct IfInfo {
    pub name: String,
    pub ifindex: usize,
    pub hwaddr: EthernetAddress,
    pub ip_addr: Ipv4Address,
    pub broadcast_ip: Ipv4Address,
    pub mtu: usize,
    pub flags: u32,
}

fn resolve(stack: &Stack, if_name: &str) -> Result<Arc<Device>> {
    stack.registry().get_by_name(if_name).ok_or(Error::NoDevice)
}

/// Configure addressing and bring the interface up, installing its local
/// routes and connecting it to the stack manager.
pub fn ifup(stack: &Arc<Stack>, cmd: &CoreCmd) -> Result<()> {
    let dev = resolve(stack, &cmd.if_name)?;

    if let Some(hwaddr) = cmd.hwaddr {
        dev.set_hwaddr(hwaddr);
    }
    dev.set_ipv4(cmd.ip_addr, cmd.broadcast_ip);
    dev.set_flags(cmd.set_flags & !flags::IFF_UP, cmd.clear_flags & !flags::IFF_UP);

    if !dev.is_up() {
        dev.stack_connect(stack.manager().rx_handle());
        dev.open()?;
    }

    // The local address resolves to ourselves.
    if !cmd.ip_addr.is_unspecified() {
        stack
            .ipv4()
            .routes
            .add_host(cmd.ip_addr, dev.hwaddr(), dev.clone())?;
    }
    info!("{} up, addr {}", dev.name(), cmd.ip_addr);
    Ok(())
}

/// Take the interface down. Refused while a discipline is attached; the
/// discipline must be detached (with its consent) first.
pub fn ifdown(stack: &Arc<Stack>, if_name: &str) -> Result<()> {
    let dev = resolve(stack, if_name)?;
    dev.close()?;
    dev.stack_disconnect();
    stack.ipv4().routes.flush_device(&dev);
    dev.set_ipv4(Ipv4Address::UNSPECIFIED, Ipv4Address::UNSPECIFIED);
    info!("{} down", dev.name());
    Ok(())
}

/// Query one interface, or all of them.
pub fn ifinfo(stack: &Arc<Stack>, if_name: Option<&str>) -> Result<Vec<IfInfo>> {
    let mut out = Vec::new();
    let collect = |dev: &Arc<Device>, out: &mut Vec<IfInfo>| {
        out.push(IfInfo {
            name: dev.name().to_string(),
            ifindex: dev.ifindex(),
            hwaddr: dev.hwaddr(),
            ip_addr: dev.local_ip(),
            broadcast_ip: dev.broadcast_ip(),
            mtu: dev.mtu(),
            flags: dev.flags(),
        })
    };
    match if_name {
        Some(name) => collect(&resolve(stack, name)?, &mut out),
        None => stack.registry().for_each(|dev| collect(dev, &mut out)),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Loopback;
    use crate::{Stack, StackConfig};

    fn loopback_cmd() -> CoreCmd {
        CoreCmd {
            if_name: "rtlo".into(),
            ip_addr: Ipv4Address::new(10, 0, 0, 1),
            broadcast_ip: Ipv4Address::new(10, 255, 255, 255),
            set_flags: 0,
            clear_flags: 0,
            hwaddr: None,
        }
    }

    #[test]
    fn ifup_installs_route_and_ifdown_removes_it() {
        let stack = Stack::new(StackConfig::default());
        stack.register_device(Loopback::device()).unwrap();

        ifup(&stack, &loopback_cmd()).unwrap();
        let dev = stack.registry().get_by_name("rtlo").unwrap();
        assert!(dev.is_up());
        assert!(stack
            .ipv4()
            .routes
            .get_host(Ipv4Address::new(10, 0, 0, 1))
            .is_some());

        let info = ifinfo(&stack, Some("rtlo")).unwrap();
        assert_eq!(info[0].ip_addr, Ipv4Address::new(10, 0, 0, 1));

        ifdown(&stack, "rtlo").unwrap();
        assert!(!dev.is_up());
        assert!(stack
            .ipv4()
            .routes
            .get_host(Ipv4Address::new(10, 0, 0, 1))
            .is_none());
    }

    #[test]
    fn unknown_interface_is_reported() {
        let stack = Stack::new(StackConfig::default());
        assert_eq!(ifup(&stack, &loopback_cmd()), Err(Error::NoDevice));
        assert_eq!(ifdown(&stack, "rteth7"), Err(Error::NoDevice));
        assert_eq!(ifinfo(&stack, Some("rteth7")).err(), Some(Error::NoDevice));
    }
}
