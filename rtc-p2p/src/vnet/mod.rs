//! A deterministic in-memory datagram network.
//!
//! Sockets created through [`VirtualNetwork`] never touch the OS. Every
//! datagram or socket event is queued and handed out by
//! [`VirtualNetwork::poll_delivery`] together with the IP of the host it is
//! destined for, so a test drives any number of peers from one thread.


use bytes::BytesMut;
use log::trace;
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

use crate::socket::*;

const EPHEMERAL_PORT_MIN: u16 = 49152;
const EPHEMERAL_PORT_MAX: u16 = 65535;

struct SocketEntry {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    state: SocketState,
    writable: bool,
    options: HashMap<SocketOption, i32>,
}

#[derive(Default)]
struct NetworkState {
    next_socket_id: u64,
    sockets: HashMap<SocketId, SocketEntry>,
    // ports are never handed out twice, even after close
    allocated: HashSet<SocketAddr>,
    failing_hosts: HashSet<IpAddr>,
    deliveries: VecDeque<(IpAddr, SocketMessage)>,
    dropped: usize,
}

impl NetworkState {
    fn allocate_port(&mut self, ip: IpAddr, min_port: u16, max_port: u16) -> Result<SocketAddr> {
        let (lo, hi) = if min_port == 0 && max_port == 0 {
            (EPHEMERAL_PORT_MIN, EPHEMERAL_PORT_MAX)
        } else {
            (min_port.max(1), max_port)
        };

        for port in lo..=hi {
            let addr = SocketAddr::new(ip, port);
            if self.allocated.insert(addr) {
                return Ok(addr);
            }
        }

        Err(Error::ErrNoAvailablePort(min_port, max_port))
    }

    fn insert_socket(
        &mut self,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        state: SocketState,
    ) -> SocketId {
        self.next_socket_id += 1;
        let id = SocketId(self.next_socket_id);
        self.sockets.insert(
            id,
            SocketEntry {
                local,
                remote,
                state,
                writable: true,
                options: HashMap::new(),
            },
        );
        id
    }

    fn entry(&self, id: SocketId) -> Result<&SocketEntry> {
        self.sockets.get(&id).ok_or(Error::ErrSocketClosed)
    }

    fn entry_mut(&mut self, id: SocketId) -> Result<&mut SocketEntry> {
        self.sockets.get_mut(&id).ok_or(Error::ErrSocketClosed)
    }

    fn find_socket(&self, pred: impl Fn(&SocketEntry) -> bool) -> Option<SocketId> {
        // lowest id first keeps delivery deterministic
        self.sockets
            .iter()
            .filter(|(_, entry)| entry.state != SocketState::Closed && pred(entry))
            .map(|(id, _)| *id)
            .min()
    }

    fn route(
        &mut self,
        net: &Rc<RefCell<NetworkState>>,
        from: SocketId,
        data: &[u8],
        to: SocketAddr,
        now: Instant,
    ) -> Result<usize> {
        let entry = self.entry(from)?;
        if entry.state == SocketState::Closed {
            return Err(Error::ErrSocketClosed);
        }
        if !entry.writable {
            return Err(Error::ErrWouldBlock);
        }
        let from_addr = entry.local;

        let connected = self.find_socket(|e| {
            e.state == SocketState::Connected && e.local == to && e.remote == Some(from_addr)
        });

        let target = if let Some(id) = connected {
            Some(id)
        } else if let Some(listener) =
            self.find_socket(|e| e.state == SocketState::Listening && e.local == to)
        {
            let accepted = self.insert_socket(to, Some(from_addr), SocketState::Connected);
            trace!("vnet: {listener} accepted {accepted} for {from_addr}");
            self.deliveries.push_back((
                to.ip(),
                SocketMessage {
                    now,
                    socket_id: listener,
                    event: SocketEvent::NewConnection(Box::new(VirtualSocket {
                        id: accepted,
                        net: Rc::clone(net),
                    })),
                },
            ));
            Some(accepted)
        } else {
            self.find_socket(|e| e.state == SocketState::Bound && e.local == to)
        };

        match target {
            Some(socket_id) => {
                self.deliveries.push_back((
                    to.ip(),
                    SocketMessage {
                        now,
                        socket_id,
                        event: SocketEvent::Read(TaggedBytesMut {
                            now,
                            transport: TransportContext::new(to, from_addr),
                            message: BytesMut::from(data),
                        }),
                    },
                ));
            }
            None => {
                trace!("vnet: no socket at {to}, dropping {} bytes", data.len());
                self.dropped += 1;
            }
        }

        Ok(data.len())
    }
}

/// Handle to the shared in-memory network. Cloning shares the network.
#[derive(Clone, Default)]
pub struct VirtualNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl VirtualNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the next pending socket event and the IP of the host it is for.
    pub fn poll_delivery(&self) -> Option<(IpAddr, SocketMessage)> {
        self.state.borrow_mut().deliveries.pop_front()
    }

    /// Closes a socket from the network side; its owner sees
    /// [`SocketEvent::Closed`].
    pub fn close_socket(&self, id: SocketId, now: Instant) {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.sockets.get_mut(&id) else {
            return;
        };
        if entry.state == SocketState::Closed {
            return;
        }
        entry.state = SocketState::Closed;
        let ip = entry.local.ip();
        state.deliveries.push_back((
            ip,
            SocketMessage {
                now,
                socket_id: id,
                event: SocketEvent::Closed(Some("closed by network".to_owned())),
            },
        ));
    }

    /// Simulates a full (or drained) send buffer.
    pub fn set_writable(&self, id: SocketId, writable: bool, now: Instant) {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.sockets.get_mut(&id) else {
            return;
        };
        let was_writable = entry.writable;
        entry.writable = writable;
        let ip = entry.local.ip();
        if writable && !was_writable {
            state.deliveries.push_back((
                ip,
                SocketMessage {
                    now,
                    socket_id: id,
                    event: SocketEvent::ReadyToSend,
                },
            ));
        }
    }

    /// Makes every socket creation on `ip` fail.
    pub fn set_host_failing(&self, ip: IpAddr, failing: bool) {
        let mut state = self.state.borrow_mut();
        if failing {
            state.failing_hosts.insert(ip);
        } else {
            state.failing_hosts.remove(&ip);
        }
    }

    pub fn socket_state(&self, id: SocketId) -> Option<SocketState> {
        self.state.borrow().sockets.get(&id).map(|entry| entry.state)
    }

    pub fn socket_option(&self, id: SocketId, option: SocketOption) -> Option<i32> {
        self.state
            .borrow()
            .sockets
            .get(&id)
            .and_then(|entry| entry.options.get(&option).copied())
    }

    /// Ids of the sockets on `ip` that are not closed.
    pub fn open_sockets(&self, ip: IpAddr) -> Vec<SocketId> {
        let state = self.state.borrow();
        let mut ids: Vec<SocketId> = state
            .sockets
            .iter()
            .filter(|(_, entry)| entry.state != SocketState::Closed && entry.local.ip() == ip)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of datagrams that found no socket.
    pub fn dropped(&self) -> usize {
        self.state.borrow().dropped
    }

    fn create_socket(
        &self,
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
        state: SocketState,
    ) -> Result<Box<dyn PacketSocket>> {
        let mut net = self.state.borrow_mut();
        if net.failing_hosts.contains(&local_ip) {
            return Err(Error::ErrSocketCreationFailed(format!(
                "host {local_ip} is failing"
            )));
        }
        let local = net.allocate_port(local_ip, min_port, max_port)?;
        let id = net.insert_socket(local, None, state);
        trace!("vnet: {id} bound to {local}");

        Ok(Box::new(VirtualSocket {
            id,
            net: Rc::clone(&self.state),
        }))
    }
}

impl PacketSocketFactory for VirtualNetwork {
    fn create_udp_socket(
        &self,
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> Result<Box<dyn PacketSocket>> {
        self.create_socket(local_ip, min_port, max_port, SocketState::Bound)
    }

    fn create_listen_socket(
        &self,
        local_ip: IpAddr,
        min_port: u16,
        max_port: u16,
    ) -> Result<Box<dyn PacketSocket>> {
        self.create_socket(local_ip, min_port, max_port, SocketState::Listening)
    }
}

struct VirtualSocket {
    id: SocketId,
    net: Rc<RefCell<NetworkState>>,
}

impl PacketSocket for VirtualSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        let net = self.net.borrow();
        net.sockets[&self.id].local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        let net = self.net.borrow();
        net.sockets[&self.id].remote
    }

    fn state(&self) -> SocketState {
        let net = self.net.borrow();
        net.sockets[&self.id].state
    }

    fn connect(&mut self, remote: SocketAddr) -> Result<()> {
        let mut net = self.net.borrow_mut();
        let entry = net.entry_mut(self.id)?;
        match entry.state {
            SocketState::Closed => Err(Error::ErrSocketClosed),
            SocketState::Listening => Err(Error::ErrAddressAlreadyInUse),
            SocketState::Bound | SocketState::Connected => {
                entry.remote = Some(remote);
                entry.state = SocketState::Connected;
                Ok(())
            }
        }
    }

    fn send(&mut self, data: &[u8], now: Instant) -> Result<usize> {
        let remote = {
            let net = self.net.borrow();
            net.entry(self.id)?.remote
        };
        let remote = remote.ok_or(Error::ErrSocketNotConnected)?;
        self.send_to(data, remote, now)
    }

    fn send_to(&mut self, data: &[u8], remote: SocketAddr, now: Instant) -> Result<usize> {
        let net = Rc::clone(&self.net);
        let mut state = self.net.borrow_mut();
        state.route(&net, self.id, data, remote, now)
    }

    fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        let mut net = self.net.borrow_mut();
        net.entry_mut(self.id)?.options.insert(option, value);
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut net) = self.net.try_borrow_mut() {
            if let Some(entry) = net.sockets.get_mut(&self.id) {
                entry.state = SocketState::Closed;
            }
        }
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        self.close();
    }
}
