//! Delivery of packet misses.
//!
//! The kernel sends a vport's misses to the netlink port configured as
//! its upcall port ID. Consuming misses therefore takes three
//! sockets: a listener socket receiving the misses, a request socket
//! used to point every vport of the datapath at the listener, and a
//! socket subscribed to vport events so vports added later get
//! configured too.
//!
//! # Design decisions
//!
//! Setting the upcall port ID of a vport makes the kernel announce the
//! vport as new. The set of configured vports is consulted and updated
//! under one lock around the request, so such an announcement never
//! triggers another request. Deleted vports are removed from the set.

use std::{collections::HashSet, sync::Arc};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    consts::socket::NlFamily,
    err::NlError,
    listener::Listener,
    ovs::{
        datapath::DatapathHandle,
        packet::{MissConsumer, MissHandler},
        vport::{Vport, VportEventConsumer, VportId},
        Dpif,
    },
    socket::NlSocket,
    utils::Groups,
};

/// Something that can point a vport at an upcall port
pub trait UpcallPortSetter: Send + Sync + 'static {
    /// Send the misses of vport `id` of datapath `ifindex` to port
    /// `pid`.
    fn set_upcall_port_id(&self, ifindex: i32, id: VportId, pid: u32) -> Result<(), NlError>;
}

impl UpcallPortSetter for Dpif {
    fn set_upcall_port_id(&self, ifindex: i32, id: VportId, pid: u32) -> Result<(), NlError> {
        self.datapath_handle(ifindex)
            .set_vport_upcall_port_id(id, pid)
    }
}

/// Points the vports of one datapath at one upcall port, at most once
/// per vport until the vport is deleted.
pub struct VportUpcallConfigurator<S> {
    setter: S,
    ifindex: i32,
    pid: u32,
    configured: Mutex<HashSet<VportId>>,
}

impl<S> VportUpcallConfigurator<S>
where
    S: UpcallPortSetter,
{
    /// Configure vports of datapath `ifindex` with upcall port `pid`.
    pub fn new(setter: S, ifindex: i32, pid: u32) -> Self {
        VportUpcallConfigurator {
            setter,
            ifindex,
            pid,
            configured: Mutex::new(HashSet::new()),
        }
    }

    /// Interface index of the datapath
    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Set the upcall port ID of vport `id` unless that was already
    /// done. Returns whether a request was sent.
    pub fn configure(&self, id: VportId) -> Result<bool, NlError> {
        let mut configured = self.configured.lock();
        if configured.contains(&id) {
            trace!("Vport {} of datapath {} already configured", id, self.ifindex);
            return Ok(false);
        }
        self.setter.set_upcall_port_id(self.ifindex, id, self.pid)?;
        configured.insert(id);
        debug!(
            "Misses of vport {} of datapath {} go to port ID {}",
            id, self.ifindex, self.pid
        );
        Ok(true)
    }

    /// Forget a deleted vport.
    pub fn forget(&self, id: VportId) {
        self.configured.lock().remove(&id);
    }

    /// Whether vport `id` is configured
    pub fn is_configured(&self, id: VportId) -> bool {
        self.configured.lock().contains(&id)
    }
}

/// Configures vports announced by vport events and forwards listener
/// errors to the miss consumer.
struct MissVportEvents<S, C> {
    configurator: Arc<VportUpcallConfigurator<S>>,
    consumer: Arc<Mutex<C>>,
}

impl<S, C> VportEventConsumer for MissVportEvents<S, C>
where
    S: UpcallPortSetter,
    C: MissConsumer,
{
    fn new_vport(&mut self, ifindex: i32, vport: Vport) -> Result<(), NlError> {
        if ifindex != self.configurator.ifindex() {
            trace!("Ignoring new vport {} of datapath {}", vport.id, ifindex);
            return Ok(());
        }
        self.configurator.configure(vport.id).map(|_| ())
    }

    fn delete_vport(&mut self, ifindex: i32, vport: Vport) -> Result<(), NlError> {
        if ifindex == self.configurator.ifindex() {
            self.configurator.forget(vport.id);
        }
        Ok(())
    }

    fn error(&mut self, err: NlError, fatal: bool) {
        self.consumer.lock().error(err, fatal)
    }
}

/// The listeners behind [`DatapathHandle::consume_misses`]. Dropping
/// it stops both.
pub struct MissListener {
    misses: Listener,
    events: Listener,
    configurator: Arc<VportUpcallConfigurator<Dpif>>,
}

impl MissListener {
    /// Port ID misses are delivered to
    pub fn pid(&self) -> u32 {
        self.misses.pid()
    }

    /// Whether vport `id` has been pointed at this listener
    pub fn is_configured(&self, id: VportId) -> bool {
        self.configurator.is_configured(id)
    }

    /// Stop both listener threads and wait for them to exit.
    pub fn stop(&mut self) {
        self.events.stop();
        self.misses.stop();
    }
}

impl DatapathHandle {
    /// Configure every vport currently in the datapath.
    fn configure_vports<S>(&self, configurator: &VportUpcallConfigurator<S>) -> Result<(), NlError>
    where
        S: UpcallPortSetter,
    {
        for vport in self.enumerate_vports()? {
            configurator.configure(vport.id)?;
        }
        Ok(())
    }

    /// Deliver the misses of this datapath to `consumer` until the
    /// returned listener is stopped or dropped.
    ///
    /// Every vport present now or added later is pointed at the
    /// listener. Errors of the miss and vport event listeners are
    /// reported to [`MissConsumer::error`].
    pub fn consume_misses<C>(&self, consumer: C) -> Result<MissListener, NlError>
    where
        C: MissConsumer,
    {
        let dpif = self.dpif();
        let socket = NlSocket::connect(NlFamily::Generic, None, Groups::empty())?;
        let pid = socket.pid()?;
        let consumer = Arc::new(Mutex::new(consumer));

        let misses = Listener::spawn(
            socket,
            *dpif.config().recv_buffer_len(),
            MissHandler {
                families: dpif.families_arc(),
                ifindex: self.ifindex(),
                consumer: Arc::clone(&consumer),
            },
        )?;
        debug!(
            "Consuming misses of datapath {} on port ID {}",
            self.ifindex(),
            pid
        );

        let configurator = Arc::new(VportUpcallConfigurator::new(
            dpif.reopen()?,
            self.ifindex(),
            pid,
        ));
        self.configure_vports(configurator.as_ref())?;
        let events = dpif.consume_vport_events(MissVportEvents {
            configurator: Arc::clone(&configurator),
            consumer,
        })?;
        // Catch vports added before the subscription took effect.
        self.configure_vports(configurator.as_ref())?;

        Ok(MissListener {
            misses,
            events,
            configurator,
        })
    }
}
