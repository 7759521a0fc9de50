//! Per-frame dispatch engine.
//!
//! The [`Dispatcher`] is the single-threaded heart of a node. A host loop
//! calls [`process`](Dispatcher::process) at its convenience; each tick
//! drains a bounded number of frames from the loopback buffer and the bus,
//! routes them through the flat opcode decode table, mutates configuration
//! through the store, and emits response frames. The two protocol timers
//! (the 100 ms enumeration window and the 30 s mode watchdog) are polled at
//! the end of every tick — nothing here suspends or blocks.
//!
//! # Example
//!
//! ```no_run
//! use railbus::dispatch::{Dispatcher, DEFAULT_FRAMES_PER_TICK};
//! use railbus::params::{ModuleName, ModuleParams};
//! use railbus::store::MemStore;
//! use railbus::time::MonotonicClock;
//! # struct MyDriver;
//! # impl railbus::bus::BusDriver for MyDriver {
//! #     fn send(&mut self, _: &railbus::protocol::Frame) -> Result<(), railbus::error::BusError> { Ok(()) }
//! #     fn has_frame(&self) -> bool { false }
//! #     fn recv(&mut self) -> Option<railbus::protocol::Frame> { None }
//! # }
//!
//! let store = MemStore::new(32, 3, 16);
//! let mut node = Dispatcher::builder(MyDriver, store, MonotonicClock::new())
//!     .params(ModuleParams::new(165, b'a', 12, 32, 3, 16, 1, 0))
//!     .name(ModuleName::new("SIGNAL"))
//!     .event_handler(|index, frame| {
//!         println!("event {index}: {:?}", frame.payload());
//!     })
//!     .build();
//!
//! loop {
//!     node.process(DEFAULT_FRAMES_PER_TICK);
//! }
//! ```

use std::collections::VecDeque;

use crate::bus::BusDriver;
use crate::callbacks::{Callbacks, FrameFilter};
use crate::enumeration::Enumeration;
use crate::events;
use crate::longmsg::FragmentHandler;
use crate::mode::{ModeMachine, ModuleMode};
use crate::params::{ModuleName, ModuleParams};
use crate::protocol::{opcodes, wire_format, CircularFrameBuffer, Frame};
use crate::store::ModuleStore;
use crate::time::Clock;
use crate::ui::{self, ModuleUi};

/// Frames drained per tick when the host has no better number.
pub const DEFAULT_FRAMES_PER_TICK: usize = 3;

/// Minimum spacing between consecutive ENRSP replies.
pub const ENRSP_PACING_MS: u64 = 10;

/// Builder for a [`Dispatcher`].
///
/// Driver, store, and clock are mandatory; everything else is optional and
/// defaults to "absent".
pub struct DispatcherBuilder<D, S, C> {
    driver: D,
    store: S,
    clock: C,
    params: ModuleParams,
    name: ModuleName,
    callbacks: Callbacks,
    ui: Option<ModuleUi>,
    fragments: Option<Box<dyn FragmentHandler>>,
    loopback_capacity: Option<usize>,
}

impl<D: BusDriver, S: ModuleStore, C: Clock> DispatcherBuilder<D, S, C> {
    /// Set the module parameter block served to configuration tools.
    pub fn params(mut self, params: ModuleParams) -> Self {
        self.params = params;
        self
    }

    /// Set the 7-byte module name.
    pub fn name(mut self, name: ModuleName) -> Self {
        self.name = name;
        self
    }

    /// Attach the indicator/button block.
    pub fn ui(mut self, ui: ModuleUi) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Register the plain accessory event handler.
    pub fn event_handler(mut self, handler: impl FnMut(u8, &Frame) + 'static) -> Self {
        self.callbacks.event = Some(Box::new(handler));
        self
    }

    /// Register the extended accessory event handler (also receives the
    /// polarity and the first event-variable value).
    pub fn event_handler_ex(mut self, handler: impl FnMut(u8, &Frame, bool, u8) + 'static) -> Self {
        self.callbacks.event_ex = Some(Box::new(handler));
        self
    }

    /// Register a frame observer. An empty `opcodes` list accepts every
    /// frame.
    pub fn frame_filter(mut self, handler: impl FnMut(&Frame) + 'static, opcodes: Vec<u8>) -> Self {
        self.callbacks.filter = Some(FrameFilter::new(Box::new(handler), opcodes));
        self
    }

    /// Register an observer called for every successfully transmitted
    /// frame.
    pub fn transmit_observer(mut self, handler: impl FnMut(&Frame) + 'static) -> Self {
        self.callbacks.transmit = Some(Box::new(handler));
        self
    }

    /// Attach the long-message fragment service.
    pub fn fragment_handler(mut self, handler: impl FragmentHandler + 'static) -> Self {
        self.fragments = Some(Box::new(handler));
        self
    }

    /// Enable the consume-own-events loopback path with the given buffer
    /// capacity.
    pub fn consume_own_events(mut self, capacity: usize) -> Self {
        self.loopback_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Dispatcher<D, S, C> {
        let mut dispatcher = Dispatcher {
            driver: self.driver,
            store: self.store,
            clock: self.clock,
            params: self.params,
            name: self.name,
            callbacks: self.callbacks,
            ui: self.ui,
            fragments: self.fragments,
            loopback: self.loopback_capacity.map(CircularFrameBuffer::new),
            mode: ModeMachine::new(),
            enumeration: Enumeration::new(),
            enum_required: false,
            learn_mode: false,
            enrsp_backlog: VecDeque::new(),
            last_enrsp_at: None,
            sent: 0,
            received: 0,
        };
        dispatcher.indicate_current_mode();
        dispatcher
    }
}

/// The operation-code-driven frame engine.
pub struct Dispatcher<D, S, C> {
    driver: D,
    store: S,
    clock: C,
    params: ModuleParams,
    name: ModuleName,
    callbacks: Callbacks,
    ui: Option<ModuleUi>,
    fragments: Option<Box<dyn FragmentHandler>>,
    loopback: Option<CircularFrameBuffer>,
    mode: ModeMachine,
    enumeration: Enumeration,
    enum_required: bool,
    learn_mode: bool,
    enrsp_backlog: VecDeque<Frame>,
    last_enrsp_at: Option<u64>,
    sent: u64,
    received: u64,
}

impl<D: BusDriver, S: ModuleStore, C: Clock> Dispatcher<D, S, C> {
    pub fn builder(driver: D, store: S, clock: C) -> DispatcherBuilder<D, S, C> {
        DispatcherBuilder {
            driver,
            store,
            clock,
            params: ModuleParams::default(),
            name: ModuleName::default(),
            callbacks: Callbacks::new(),
            ui: None,
            fragments: None,
            loopback_capacity: None,
        }
    }

    /// Run one cooperative tick: service a scheduled enumeration, the UI,
    /// up to `max_frames` inbound frames, the paced ENRSP backlog, and both
    /// protocol timers.
    pub fn process(&mut self, max_frames: usize) {
        let now_ms = self.clock.now_ms();

        if self.enum_required {
            self.enum_required = false;
            self.begin_enumeration(now_ms);
        }

        self.service_ui(now_ms);

        let mut drained = 0;
        while drained < max_frames {
            let Some(frame) = self.next_frame() else { break };
            drained += 1;
            self.received += 1;

            if let Some(filter) = self.callbacks.filter.as_mut() {
                if filter.accepts(frame.opcode()) {
                    (filter.callback)(&frame);
                }
            }

            self.handle_frame(&frame, now_ms);
        }

        self.service_enrsp_backlog(now_ms);
        self.check_enumeration(now_ms);
        self.check_mode_timeout(now_ms);
    }

    /// Loopback frames take priority over the bus source.
    fn next_frame(&mut self) -> Option<Frame> {
        if let Some(loopback) = self.loopback.as_mut() {
            if let Some(frame) = loopback.get() {
                return Some(frame);
            }
        }
        if self.driver.has_frame() {
            self.driver.recv()
        } else {
            None
        }
    }

    fn handle_frame(&mut self, frame: &Frame, now_ms: u64) {
        let remote_local_id = frame.local_id();

        if let Some(ui) = self.ui.as_mut() {
            ui.green.pulse();
        }

        // A peer is enumerating: answer the probe with our own identifier.
        if frame.is_probe() {
            tracing::trace!(peer = remote_local_id, "probe answered");
            self.send(Frame::new());
            return;
        }

        // Another producer is using our identifier. Schedule an enumeration
        // for the next tick; our own looped-back frames carry our node
        // number and are exempt.
        if frame.len > 0
            && remote_local_id == self.store.local_id()
            && frame.node_number() != self.store.node_number()
        {
            tracing::debug!(peer = remote_local_id, "identifier clash, enumeration scheduled");
            self.enum_required = true;
        }

        // Extended frames are bootloader traffic.
        if frame.ext {
            return;
        }

        // Zero-length standard frames are only meaningful as enumeration
        // responses.
        if frame.len == 0 {
            if self.enumeration.in_progress() {
                self.enumeration.record(remote_local_id);
            }
            return;
        }

        let opc = frame.data[0];
        let nn = frame.node_number();
        let en = frame.event_number();
        let our_nn = self.store.node_number();

        match opc {
            _ if opcodes::is_accessory(opc) => {
                if self.callbacks.has_event_handler() {
                    let key_nn = if opcodes::is_short_accessory(opc) { 0 } else { nn };
                    self.process_accessory_event(frame, key_nn, en, opcodes::is_on_event(opc));
                }
            }

            opcodes::RQNP => self.on_rqnp(),
            opcodes::RQNPN if nn == our_nn => self.on_rqnpn(frame),
            opcodes::SNN => self.on_snn(frame, now_ms),
            opcodes::RQNN => self.on_rqnn(),
            opcodes::CANID if nn == our_nn => self.on_canid(frame),
            opcodes::ENUM if nn == our_nn => self.on_enum(remote_local_id, now_ms),
            opcodes::NVRD if nn == our_nn => self.on_nvrd(frame),
            opcodes::NVSET if nn == our_nn => self.on_nvset(frame),
            opcodes::NNLRN if nn == our_nn => self.set_learn_mode(true),
            opcodes::NNULN if nn == our_nn => self.set_learn_mode(false),
            opcodes::EVULN => self.on_evuln(nn, en),
            opcodes::EVLRN => self.on_evlrn(frame, nn, en),
            opcodes::NNCLR if nn == our_nn => self.on_nnclr(),
            opcodes::NNEVN if nn == our_nn => self.on_nnevn(),
            opcodes::RQEVN if nn == our_nn => self.on_rqevn(),
            opcodes::NERD if nn == our_nn => self.on_nerd(),
            opcodes::REVAL if nn == our_nn => self.on_reval(frame),

            opcodes::QNN => self.on_qnn(),
            opcodes::RQMN => self.on_rqmn(),

            opcodes::DTXC => {
                if let Some(handler) = self.fragments.as_mut() {
                    handler.on_fragment(frame);
                }
            }

            // Recognized but deliberately inert for an accessory node.
            opcodes::BOOT | opcodes::RSTAT => {}

            _ => tracing::trace!(opc, "unhandled opcode ignored"),
        }
    }

    fn process_accessory_event(&mut self, frame: &Frame, nn: u16, en: u16, is_on: bool) {
        let Some(index) = events::resolve(&self.store, nn, en) else {
            return;
        };
        if let Some(handler) = self.callbacks.event.as_mut() {
            handler(index, frame);
        } else if let Some(handler) = self.callbacks.event_ex.as_mut() {
            let first_ev = if self.store.ev_vars_per_event() > 0 {
                self.store.event_variable(index, 1)
            } else {
                0
            };
            handler(index, frame, is_on, first_ev);
        }
    }

    // --- setup dialogue -------------------------------------------------

    /// RQNP carries no node number; it is only answered while we are the
    /// node in transition.
    fn on_rqnp(&mut self) {
        if !self.mode.is_changing() {
            return;
        }
        let p = &self.params;
        self.send(Frame::with_payload(&[
            opcodes::PARAMS,
            p.get(1),
            p.get(2),
            p.get(3),
            p.get(4),
            p.get(5),
            p.get(6),
            p.get(7),
        ]));
    }

    fn on_rqnpn(&mut self, frame: &Frame) {
        let index = frame.data[3];
        if index > self.params.readable_count() {
            self.send_cmderr(opcodes::CMDERR_INVALID_PARAM);
            return;
        }
        let value = self.params.get(index);
        let mut reply = Frame::with_payload(&[opcodes::PARAN, 0, 0, index, value]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    fn on_snn(&mut self, frame: &Frame, now_ms: u64) {
        if !self.mode.is_changing() {
            tracing::trace!("SNN outside transition ignored");
            return;
        }
        let nn = frame.node_number();
        if let Err(error) = self.store.set_node_number(nn) {
            tracing::error!(%error, nn, "failed to persist node number");
            return;
        }
        self.send_nnack();

        self.mode.settle();
        if let Err(error) = self.store.set_flexible_mode(true) {
            tracing::error!(%error, "failed to persist flexible mode");
        }
        self.indicate_current_mode();
        tracing::debug!(nn, "node number assigned, now flexible");

        self.begin_enumeration(now_ms);
    }

    /// Another node has opened the setup dialogue; abandon ours.
    fn on_rqnn(&mut self) {
        if !self.mode.is_changing() {
            return;
        }
        tracing::debug!("setup dialogue seized by another node");
        self.mode.settle();
        self.indicate_current_mode();
        self.send_nnack();
    }

    fn on_canid(&mut self, frame: &Frame) {
        let id = frame.data[3];
        if !(1..=wire_format::MAX_ASSIGNED_LOCAL_ID).contains(&id) {
            self.send_cmderr(opcodes::CMDERR_INVALID_IDENTIFIER);
            return;
        }
        if let Err(error) = self.store.set_local_id(id) {
            tracing::error!(%error, id, "failed to persist identifier");
        }
    }

    fn on_enum(&mut self, remote_local_id: u8, now_ms: u64) {
        if remote_local_id != self.store.local_id() && !self.enumeration.in_progress() {
            self.begin_enumeration(now_ms);
        }
    }

    // --- node variables -------------------------------------------------

    fn on_nvrd(&mut self, frame: &Frame) {
        let index = frame.data[3];
        if index > self.store.node_var_count() {
            self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            return;
        }
        let value = self.store.read_nv(index);
        let mut reply = Frame::with_payload(&[opcodes::NVANS, 0, 0, index, value]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    fn on_nvset(&mut self, frame: &Frame) {
        let index = frame.data[3];
        if index > self.store.node_var_count() {
            self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            return;
        }
        match self.store.write_nv(index, frame.data[4]) {
            Ok(()) => self.send_wrack(),
            Err(error) => {
                tracing::error!(%error, index, "node-variable write failed");
                self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            }
        }
    }

    // --- event table ----------------------------------------------------

    fn set_learn_mode(&mut self, learning: bool) {
        self.learn_mode = learning;
        self.params.set_learn_flag(learning);
        tracing::debug!(learning, "learn mode");
    }

    fn on_evlrn(&mut self, frame: &Frame, nn: u16, en: u16) {
        if !self.learn_mode {
            return;
        }
        let ev_index = frame.data[5];
        let ev_value = frame.data[6];
        match events::learn(&mut self.store, nn, en, ev_index, ev_value) {
            Ok(_) => self.send_wrack(),
            Err(error) => {
                tracing::debug!(%error, nn, en, "learn rejected");
                self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            }
        }
    }

    fn on_evuln(&mut self, nn: u16, en: u16) {
        if !self.learn_mode {
            return;
        }
        match events::unlearn(&mut self.store, nn, en) {
            Ok(_) => self.send_wrack(),
            Err(error) => {
                tracing::debug!(%error, nn, en, "unlearn rejected");
                self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            }
        }
    }

    fn on_nnclr(&mut self) {
        if !self.learn_mode {
            return;
        }
        match events::clear_all(&mut self.store) {
            Ok(()) => self.send_wrack(),
            Err(error) => {
                tracing::error!(%error, "event table clear failed");
                self.send_cmderr(opcodes::CMDERR_INVALID_NV);
            }
        }
    }

    fn on_nnevn(&mut self) {
        let free = events::free_slots(&self.store);
        let mut reply = Frame::with_payload(&[opcodes::EVNLF, 0, 0, free]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    fn on_rqevn(&mut self) {
        let count = self.store.num_events();
        let mut reply = Frame::with_payload(&[opcodes::NUMEV, 0, 0, count]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    /// Queue one ENRSP per stored event; the backlog is drained by
    /// `process()` at the ≥10 ms pacing the receivers expect.
    fn on_nerd(&mut self) {
        let nn = self.store.node_number();
        for index in 0..self.store.event_capacity() {
            let Some(header) = self.store.read_event(index) else {
                continue;
            };
            let mut reply = Frame::with_payload(&[
                opcodes::ENRSP,
                0,
                0,
                header[0],
                header[1],
                header[2],
                header[3],
                index,
            ]);
            reply.set_node_number(nn);
            self.enrsp_backlog.push_back(reply);
        }
        tracing::debug!(queued = self.enrsp_backlog.len(), "event readout queued");
    }

    fn on_reval(&mut self, frame: &Frame) {
        let index = frame.data[3];
        let ev_index = frame.data[4];
        if !self.store.entry_in_use(index) {
            self.send_cmderr(opcodes::CMDERR_INVALID_EVENT);
            return;
        }
        let value = self.store.event_variable(index, ev_index);
        let mut reply = Frame::with_payload(&[opcodes::NEVAL, 0, 0, index, ev_index, value]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    // --- presence -------------------------------------------------------

    fn on_qnn(&mut self) {
        if self.store.node_number() == 0 {
            return;
        }
        let mut reply = Frame::with_payload(&[
            opcodes::PNN,
            0,
            0,
            self.params.get(1),
            self.params.get(3),
            self.params.flags(),
        ]);
        reply.set_node_number(self.store.node_number());
        self.send(reply);
    }

    fn on_rqmn(&mut self) {
        if !self.mode.is_changing() {
            return;
        }
        let name = self.name.as_bytes();
        self.send(Frame::with_payload(&[
            opcodes::NAME,
            name[0],
            name[1],
            name[2],
            name[3],
            name[4],
            name[5],
            name[6],
        ]));
    }

    // --- mode transitions ----------------------------------------------

    /// Start the lean → flexible dialogue: announce with RQNN and wait for
    /// a configuration tool to answer with SNN.
    pub fn begin_mode_transition(&mut self) {
        self.indicate_mode(ModuleMode::Transitioning);
        let now_ms = self.clock.now_ms();
        self.mode.begin_transition(now_ms);

        let mut request = Frame::with_payload(&[opcodes::RQNN, 0, 0]);
        request.set_node_number(self.store.node_number());
        self.send(request);
    }

    /// Give up the node number and return to lean mode.
    pub fn revert_to_lean(&mut self) {
        let mut release = Frame::with_payload(&[opcodes::NNREL, 0, 0]);
        release.set_node_number(self.store.node_number());
        self.send(release);

        self.mode.settle();
        if let Err(error) = self.store.set_node_number(0) {
            tracing::error!(%error, "failed to clear node number");
        }
        if let Err(error) = self.store.set_flexible_mode(false) {
            tracing::error!(%error, "failed to clear flexible mode");
        }
        if let Err(error) = self.store.set_local_id(0) {
            tracing::error!(%error, "failed to clear identifier");
        }
        self.indicate_current_mode();
        tracing::debug!("reverted to lean mode");
    }

    /// Re-enter the setup dialogue to change or re-confirm the node number.
    pub fn renegotiate(&mut self) {
        self.begin_mode_transition();
    }

    /// Start a bus-identifier enumeration cycle now.
    pub fn start_enumeration(&mut self) {
        let now_ms = self.clock.now_ms();
        self.begin_enumeration(now_ms);
    }

    fn begin_enumeration(&mut self, now_ms: u64) {
        self.enumeration.begin(now_ms);
        self.send(Frame::probe());
    }

    fn check_enumeration(&mut self, now_ms: u64) {
        if !self.enumeration.window_elapsed(now_ms) {
            return;
        }
        let selected = self.enumeration.select_free();
        self.enumeration.finish();
        if let Err(error) = self.store.set_local_id(selected) {
            tracing::error!(%error, selected, "failed to persist identifier");
        }
        tracing::debug!(selected, "enumeration complete");
        self.send_nnack();
    }

    fn check_mode_timeout(&mut self, now_ms: u64) {
        if !self.mode.timed_out(now_ms) {
            return;
        }
        tracing::debug!("mode transition timed out");
        self.mode.settle();
        self.indicate_current_mode();
    }

    // --- user interface -------------------------------------------------

    fn service_ui(&mut self, now_ms: u64) {
        let (armed, released, press_time) = {
            let Some(ui) = self.ui.as_mut() else { return };
            ui.green.tick(now_ms);
            ui.yellow.tick(now_ms);
            ui.button.tick(now_ms);

            let armed = ui.button.is_pressed()
                && ui.button.current_state_duration_ms() > ui::HOLD_FOR_TRANSITION_MS;
            let released = ui.button.state_changed() && !ui.button.is_pressed();
            (armed, released, ui.button.last_press_duration_ms())
        };

        // Show the user that releasing the held button will act.
        if armed {
            self.indicate_mode(ModuleMode::Transitioning);
        }

        if !released {
            return;
        }

        if press_time > ui::HOLD_FOR_TRANSITION_MS {
            if self.store.flexible_mode() {
                self.revert_to_lean();
            } else {
                self.begin_mode_transition();
            }
        } else if (ui::RENEGOTIATE_MIN_MS..ui::RENEGOTIATE_MAX_MS).contains(&press_time) {
            self.renegotiate();
        } else if press_time < ui::ENUM_TAP_MAX_MS && self.store.flexible_mode() {
            self.start_enumeration();
        }
    }

    fn indicate_mode(&mut self, mode: ModuleMode) {
        let Some(ui) = self.ui.as_mut() else { return };
        match mode {
            ModuleMode::Lean => {
                ui.yellow.off();
                ui.green.on();
            }
            ModuleMode::Flexible => {
                ui.yellow.on();
                ui.green.off();
            }
            ModuleMode::Transitioning => {
                ui.yellow.blink();
                ui.green.off();
            }
        }
    }

    fn indicate_current_mode(&mut self) {
        let mode = self.mode.current(self.store.flexible_mode());
        self.indicate_mode(mode);
    }

    // --- transmission ---------------------------------------------------

    /// Rewrite the identifier and hand the frame to the driver. Successful
    /// sends are mirrored to the transmit observer; outbound accessory
    /// events are additionally copied into the loopback buffer so the node
    /// can consume what it produces.
    fn send(&mut self, mut frame: Frame) {
        frame.id = wire_format::encode_id(wire_format::DEFAULT_PRIORITY, self.store.local_id());
        match self.driver.send(&frame) {
            Ok(()) => {
                self.sent += 1;
                if let Some(observer) = self.callbacks.transmit.as_mut() {
                    observer(&frame);
                }
                if frame.opcode().is_some_and(opcodes::is_accessory) {
                    if let Some(loopback) = self.loopback.as_mut() {
                        loopback.put(&frame, self.clock.now_ms());
                    }
                }
            }
            Err(error) => tracing::warn!(%error, "transmit failed"),
        }
    }

    fn send_wrack(&mut self) {
        let mut ack = Frame::with_payload(&[opcodes::WRACK, 0, 0]);
        ack.set_node_number(self.store.node_number());
        self.send(ack);
    }

    fn send_nnack(&mut self) {
        let mut ack = Frame::with_payload(&[opcodes::NNACK, 0, 0]);
        ack.set_node_number(self.store.node_number());
        self.send(ack);
    }

    fn send_cmderr(&mut self, code: u8) {
        let mut err = Frame::with_payload(&[opcodes::CMDERR, 0, 0, code]);
        err.set_node_number(self.store.node_number());
        self.send(err);
    }

    fn service_enrsp_backlog(&mut self, now_ms: u64) {
        if self.enrsp_backlog.is_empty() {
            return;
        }
        if let Some(last) = self.last_enrsp_at {
            if now_ms.saturating_sub(last) < ENRSP_PACING_MS {
                return;
            }
        }
        if let Some(reply) = self.enrsp_backlog.pop_front() {
            self.send(reply);
            self.last_enrsp_at = Some(now_ms);
        }
    }

    /// Transmit a host-built frame.
    ///
    /// The identifier is rewritten with the default priority and our local
    /// identifier before the driver sees it, like every other outbound
    /// frame. This is how a producing host puts accessory events on the
    /// bus.
    pub fn send_frame(&mut self, frame: Frame) {
        self.send(frame);
    }

    // --- accessors ------------------------------------------------------

    /// The persisted node number.
    pub fn node_number(&self) -> u16 {
        self.store.node_number()
    }

    /// The claimed bus identifier.
    pub fn local_id(&self) -> u8 {
        self.store.local_id()
    }

    /// The currently observable operating mode.
    pub fn current_mode(&self) -> ModuleMode {
        self.mode.current(self.store.flexible_mode())
    }

    /// Is the node accepting event-table mutations?
    pub fn is_learn_mode(&self) -> bool {
        self.learn_mode
    }

    /// Frames successfully transmitted since construction.
    pub fn frames_sent(&self) -> u64 {
        self.sent
    }

    /// Frames drained (loopback and bus) since construction.
    pub fn frames_received(&self) -> u64 {
        self.received
    }

    /// The loopback buffer, when consume-own-events is enabled.
    pub fn loopback(&self) -> Option<&CircularFrameBuffer> {
        self.loopback.as_ref()
    }

    /// The configuration store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the configuration store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// The bus driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable access to the bus driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::error::BusError;
    use crate::params::FLAG_LEARN;
    use crate::store::MemStore;
    use crate::time::ManualClock;

    #[derive(Default)]
    struct MockBus {
        inbound: VecDeque<Frame>,
        outbound: Vec<Frame>,
    }

    impl BusDriver for MockBus {
        fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
            self.outbound.push(*frame);
            Ok(())
        }

        fn has_frame(&self) -> bool {
            !self.inbound.is_empty()
        }

        fn recv(&mut self) -> Option<Frame> {
            self.inbound.pop_front()
        }
    }

    type TestNode = Dispatcher<MockBus, MemStore, ManualClock>;

    const NN: u16 = 260;
    const OUR_ID: u8 = 5;

    fn test_params() -> ModuleParams {
        ModuleParams::new(165, b'a', 12, 8, 3, 4, 1, 0)
    }

    /// A node already in flexible mode with node number 260 and id 5.
    fn configured_node() -> (TestNode, ManualClock) {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        store.set_local_id(OUR_ID).unwrap();
        store.set_flexible_mode(true).unwrap();
        let node = Dispatcher::builder(MockBus::default(), store, clock.clone())
            .params(test_params())
            .name(ModuleName::new("TEST"))
            .build();
        (node, clock)
    }

    fn data_frame(peer: u8, payload: &[u8]) -> Frame {
        let mut frame = Frame::with_payload(payload);
        frame.id = wire_format::encode_id(wire_format::DEFAULT_PRIORITY, peer);
        frame
    }

    fn zero_len_frame(peer: u8) -> Frame {
        let mut frame = Frame::new();
        frame.id = wire_format::encode_id(wire_format::DEFAULT_PRIORITY, peer);
        frame
    }

    fn inject(node: &mut TestNode, frame: Frame) {
        node.driver_mut().inbound.push_back(frame);
    }

    fn outbound(node: &TestNode) -> &[Frame] {
        &node.driver().outbound
    }

    fn nn_bytes(frame: &Frame) -> u16 {
        frame.node_number()
    }

    #[test]
    fn test_probe_is_answered_with_our_identifier() {
        let (mut node, _clock) = configured_node();
        let mut probe = Frame::probe();
        probe.id = wire_format::encode_id(wire_format::DEFAULT_PRIORITY, 9);
        inject(&mut node, probe);

        node.process(8);

        let replies = outbound(&node);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].len, 0);
        assert!(!replies[0].rtr);
        assert_eq!(replies[0].local_id(), OUR_ID);
    }

    #[test]
    fn test_rqnpn_in_range() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 1]));

        node.process(8);

        let replies = outbound(&node);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].data[0], opcodes::PARAN);
        assert_eq!(nn_bytes(&replies[0]), NN);
        assert_eq!(replies[0].data[3], 1);
        assert_eq!(replies[0].data[4], 165);
    }

    #[test]
    fn test_rqnpn_index_zero_reports_count() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 0]));

        node.process(8);

        assert_eq!(outbound(&node)[0].data[4], 20);
    }

    #[test]
    fn test_rqnpn_success_at_last_readable_index() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 20]));

        node.process(8);

        let reply = outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::PARAN);
        assert_eq!(reply.data[3], 20);
    }

    #[test]
    fn test_rqnpn_out_of_range() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 21]));

        node.process(8);

        let replies = outbound(&node);
        assert_eq!(replies[0].data[0], opcodes::CMDERR);
        assert_eq!(nn_bytes(&replies[0]), NN);
        assert_eq!(replies[0].data[3], opcodes::CMDERR_INVALID_PARAM);
    }

    #[test]
    fn test_rqnpn_for_other_node_ignored() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x02, 0x00, 1]));

        node.process(8);

        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_canid_bounds() {
        let (mut node, _clock) = configured_node();

        for bad in [0u8, 100] {
            inject(&mut node, data_frame(9, &[opcodes::CANID, 0x01, 0x04, bad]));
            node.process(8);
            let reply = outbound(&node).last().unwrap();
            assert_eq!(reply.data[0], opcodes::CMDERR);
            assert_eq!(reply.data[3], opcodes::CMDERR_INVALID_IDENTIFIER);
        }
        assert_eq!(node.local_id(), OUR_ID);

        inject(&mut node, data_frame(9, &[opcodes::CANID, 0x01, 0x04, 99]));
        node.process(8);
        assert_eq!(node.local_id(), 99);

        inject(&mut node, data_frame(9, &[opcodes::CANID, 0x01, 0x04, 1]));
        node.process(8);
        assert_eq!(node.local_id(), 1);
    }

    #[test]
    fn test_nv_read_write_and_bounds() {
        let (mut node, _clock) = configured_node();

        inject(&mut node, data_frame(9, &[opcodes::NVSET, 0x01, 0x04, 2, 0xAB]));
        node.process(8);
        let replies = outbound(&node);
        assert_eq!(replies.last().unwrap().data[0], opcodes::WRACK);
        assert_eq!(node.store().read_nv(2), 0xAB);

        inject(&mut node, data_frame(9, &[opcodes::NVRD, 0x01, 0x04, 2]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::NVANS);
        assert_eq!(nn_bytes(&reply), NN);
        assert_eq!(reply.data[3], 2);
        assert_eq!(reply.data[4], 0xAB);

        // index 5 exceeds the 4 configured node variables
        inject(&mut node, data_frame(9, &[opcodes::NVRD, 0x01, 0x04, 5]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[3], opcodes::CMDERR_INVALID_NV);

        inject(&mut node, data_frame(9, &[opcodes::NVSET, 0x01, 0x04, 5, 1]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[3], opcodes::CMDERR_INVALID_NV);
    }

    #[test]
    fn test_learn_cycle() {
        let (mut node, _clock) = configured_node();

        inject(&mut node, data_frame(9, &[opcodes::NNLRN, 0x01, 0x04]));
        node.process(8);
        assert!(node.is_learn_mode());

        // learn (10, 20), EV1 = 0x77
        inject(&mut node, data_frame(9, &[opcodes::EVLRN, 0, 10, 0, 20, 1, 0x77]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[0], opcodes::WRACK);

        let index = node.store().find_existing(10, 20).expect("event stored");

        inject(&mut node, data_frame(9, &[opcodes::REVAL, 0x01, 0x04, index, 1]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::NEVAL);
        assert_eq!(reply.data[3], index);
        assert_eq!(reply.data[4], 1);
        assert_eq!(reply.data[5], 0x77);

        inject(&mut node, data_frame(9, &[opcodes::EVULN, 0, 10, 0, 20]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[0], opcodes::WRACK);
        assert_eq!(node.store().find_existing(10, 20), None);

        // a second unlearn has nothing to remove
        inject(&mut node, data_frame(9, &[opcodes::EVULN, 0, 10, 0, 20]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[3], opcodes::CMDERR_INVALID_NV);

        inject(&mut node, data_frame(9, &[opcodes::NNULN, 0x01, 0x04]));
        node.process(8);
        assert!(!node.is_learn_mode());
    }

    #[test]
    fn test_learn_flag_tracks_learn_mode() {
        let (mut node, _clock) = configured_node();

        inject(&mut node, data_frame(9, &[opcodes::NNLRN, 0x01, 0x04]));
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 8]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_ne!(reply.data[4] & FLAG_LEARN, 0);

        inject(&mut node, data_frame(9, &[opcodes::NNULN, 0x01, 0x04]));
        inject(&mut node, data_frame(9, &[opcodes::RQNPN, 0x01, 0x04, 8]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[4] & FLAG_LEARN, 0);
    }

    #[test]
    fn test_evlrn_outside_learn_mode_ignored() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::EVLRN, 0, 10, 0, 20, 1, 0x77]));

        node.process(8);

        assert!(outbound(&node).is_empty());
        assert_eq!(node.store().num_events(), 0);
    }

    #[test]
    fn test_nnclr_requires_learn_mode_and_nn_match() {
        let (mut node, _clock) = configured_node();
        node.store_mut().write_event(0, [0, 10, 0, 20]).unwrap();
        node.store_mut().update_event_hash(0);

        inject(&mut node, data_frame(9, &[opcodes::NNCLR, 0x01, 0x04]));
        node.process(8);
        assert!(outbound(&node).is_empty());
        assert_eq!(node.store().num_events(), 1);

        inject(&mut node, data_frame(9, &[opcodes::NNLRN, 0x01, 0x04]));
        inject(&mut node, data_frame(9, &[opcodes::NNCLR, 0x01, 0x04]));
        node.process(8);
        assert_eq!(outbound(&node).last().unwrap().data[0], opcodes::WRACK);
        assert_eq!(node.store().num_events(), 0);
    }

    #[test]
    fn test_event_counts() {
        let (mut node, _clock) = configured_node();
        node.store_mut().write_event(0, [0, 1, 0, 1]).unwrap();
        node.store_mut().update_event_hash(0);
        node.store_mut().write_event(3, [0, 2, 0, 2]).unwrap();
        node.store_mut().update_event_hash(3);

        inject(&mut node, data_frame(9, &[opcodes::RQEVN, 0x01, 0x04]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::NUMEV);
        assert_eq!(reply.data[3], 2);

        inject(&mut node, data_frame(9, &[opcodes::NNEVN, 0x01, 0x04]));
        node.process(8);
        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::EVNLF);
        assert_eq!(reply.data[3], 6);
    }

    #[test]
    fn test_nerd_replies_are_paced() {
        let (mut node, clock) = configured_node();
        for (i, &en) in [20u16, 21, 22].iter().enumerate() {
            let header = [0, 10, (en >> 8) as u8, en as u8];
            node.store_mut().write_event(i as u8, header).unwrap();
            node.store_mut().update_event_hash(i as u8);
        }

        inject(&mut node, data_frame(9, &[opcodes::NERD, 0x01, 0x04]));
        node.process(8);

        // one reply per tick, at least 10 ms apart
        assert_eq!(outbound(&node).len(), 1);
        node.process(8);
        assert_eq!(outbound(&node).len(), 1);

        clock.advance(ENRSP_PACING_MS);
        node.process(8);
        assert_eq!(outbound(&node).len(), 2);

        clock.advance(ENRSP_PACING_MS);
        node.process(8);
        assert_eq!(outbound(&node).len(), 3);

        let replies = outbound(&node);
        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(reply.data[0], opcodes::ENRSP);
            assert_eq!(nn_bytes(reply), NN);
            assert_eq!(reply.data[4], 10);
            assert_eq!(reply.data[6], 20 + i as u8);
            assert_eq!(reply.data[7], i as u8);
        }
    }

    #[test]
    fn test_reval_empty_entry() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::REVAL, 0x01, 0x04, 3, 1]));

        node.process(8);

        let reply = outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::CMDERR);
        assert_eq!(reply.data[3], opcodes::CMDERR_INVALID_EVENT);
    }

    #[test]
    fn test_qnn() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::QNN]));
        node.process(8);

        let reply = *outbound(&node).last().unwrap();
        assert_eq!(reply.data[0], opcodes::PNN);
        assert_eq!(nn_bytes(&reply), NN);
        assert_eq!(reply.data[3], 165);
        assert_eq!(reply.data[4], 12);
        assert_eq!(reply.len, 6);
    }

    #[test]
    fn test_qnn_silent_without_node_number() {
        let clock = ManualClock::new();
        let store = MemStore::new(8, 3, 4);
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .params(test_params())
            .build();

        inject(&mut node, data_frame(9, &[opcodes::QNN]));
        node.process(8);

        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_rqnp_and_rqmn_only_while_transitioning() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::RQNP]));
        inject(&mut node, data_frame(9, &[opcodes::RQMN]));
        node.process(8);
        assert!(outbound(&node).is_empty());

        node.begin_mode_transition(); // emits RQNN
        inject(&mut node, data_frame(9, &[opcodes::RQNP]));
        inject(&mut node, data_frame(9, &[opcodes::RQMN]));
        node.process(8);

        let replies = outbound(&node);
        assert_eq!(replies[0].data[0], opcodes::RQNN);
        assert_eq!(replies[1].data[0], opcodes::PARAMS);
        assert_eq!(replies[1].len, 8);
        assert_eq!(replies[1].payload()[1..], [165, b'a', 12, 8, 3, 4, 1]);
        assert_eq!(replies[2].data[0], opcodes::NAME);
        assert_eq!(&replies[2].data[1..8], b"TEST   ");
    }

    #[test]
    fn test_snn_assigns_node_number_and_enumerates() {
        let clock = ManualClock::new();
        let store = MemStore::new(8, 3, 4);
        let mut node = Dispatcher::builder(MockBus::default(), store, clock.clone())
            .params(test_params())
            .build();

        node.begin_mode_transition();
        inject(&mut node, data_frame(9, &[opcodes::SNN, 0x01, 0x04]));
        node.process(8);

        assert_eq!(node.node_number(), 260);
        assert!(node.store().flexible_mode());
        assert_eq!(node.current_mode(), ModuleMode::Flexible);

        let replies = outbound(&node);
        // RQNN from the transition, then NNACK, then the enumeration probe
        assert_eq!(replies[0].data[0], opcodes::RQNN);
        assert_eq!(replies[1].data[0], opcodes::NNACK);
        assert_eq!(nn_bytes(&replies[1]), 260);
        let probe = replies[2];
        assert!(probe.rtr);
        assert_eq!(probe.len, 0);
    }

    #[test]
    fn test_snn_outside_transition_ignored() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::SNN, 0x02, 0x00]));
        node.process(8);

        assert_eq!(node.node_number(), NN);
        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_rqnn_from_peer_aborts_transition() {
        let (mut node, _clock) = configured_node();
        node.begin_mode_transition();
        assert_eq!(node.current_mode(), ModuleMode::Transitioning);

        inject(&mut node, data_frame(9, &[opcodes::RQNN, 0x02, 0x00]));
        node.process(8);

        assert_eq!(node.current_mode(), ModuleMode::Flexible);
        assert_eq!(outbound(&node).last().unwrap().data[0], opcodes::NNACK);
    }

    #[test]
    fn test_mode_transition_times_out() {
        let (mut node, clock) = configured_node();
        node.begin_mode_transition();

        clock.advance(crate::mode::TRANSITION_TIMEOUT_MS - 1);
        node.process(8);
        assert_eq!(node.current_mode(), ModuleMode::Transitioning);

        clock.advance(1);
        node.process(8);
        assert_eq!(node.current_mode(), ModuleMode::Flexible);
        // timeout path stays silent; only the initial RQNN went out
        assert_eq!(outbound(&node).len(), 1);
    }

    #[test]
    fn test_identifier_clash_schedules_enumeration() {
        let (mut node, _clock) = configured_node();
        // a frame from another node (nn=100) using our identifier
        inject(&mut node, data_frame(OUR_ID, &[opcodes::ACON, 0, 100, 0, 1]));

        node.process(8);
        assert!(outbound(&node).is_empty());

        // the probe goes out at the start of the next tick
        node.process(8);
        let probe = outbound(&node)[0];
        assert!(probe.rtr);
        assert_eq!(probe.len, 0);
    }

    #[test]
    fn test_own_nn_does_not_trigger_clash() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(OUR_ID, &[opcodes::ACON, 0x01, 0x04, 0, 1]));

        node.process(8);
        node.process(8);

        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_enumeration_selects_lowest_gap() {
        let (mut node, clock) = configured_node();
        node.start_enumeration();

        for peer in [1u8, 2, 4, 5] {
            inject(&mut node, zero_len_frame(peer));
        }
        node.process(8);
        assert_eq!(node.local_id(), OUR_ID); // window still open

        clock.advance(100);
        node.process(8);

        assert_eq!(node.local_id(), 3);
        // the closing NNACK already carries the new identifier
        let ack = outbound(&node).last().unwrap();
        assert_eq!(ack.data[0], opcodes::NNACK);
        assert_eq!(ack.local_id(), 3);
    }

    #[test]
    fn test_enum_opcode_starts_enumeration() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[opcodes::ENUM, 0x01, 0x04]));
        node.process(8);

        let probe = outbound(&node)[0];
        assert!(probe.rtr);

        // our own identifier in the sender field must not restart a cycle
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(OUR_ID, &[opcodes::ENUM, 0x01, 0x04]));
        node.process(8);
        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_extended_frames_dropped() {
        let (mut node, _clock) = configured_node();
        let mut frame = data_frame(9, &[opcodes::QNN]);
        frame.ext = true;
        inject(&mut node, frame);

        node.process(8);

        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_unknown_opcode_ignored() {
        let (mut node, _clock) = configured_node();
        inject(&mut node, data_frame(9, &[0x21, 0x01, 0x04]));

        node.process(8);

        assert!(outbound(&node).is_empty());
    }

    #[test]
    fn test_accessory_event_invokes_handler() {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        store.set_local_id(OUR_ID).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .event_handler(move |index, frame| {
                sink.borrow_mut().push((index, frame.event_number()));
            })
            .build();
        events::learn(node.store_mut(), 10, 20, 1, 0).unwrap();

        inject(&mut node, data_frame(9, &[opcodes::ACON, 0, 10, 0, 20]));
        // an unlearned event must not reach the handler
        inject(&mut node, data_frame(9, &[opcodes::ACON, 0, 10, 0, 99]));
        node.process(8);

        assert_eq!(seen.borrow().as_slice(), &[(0u8, 20u16)]);
    }

    #[test]
    fn test_extended_handler_receives_polarity_and_ev() {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .event_handler_ex(move |index, _frame, on, ev1| {
                sink.borrow_mut().push((index, on, ev1));
            })
            .build();
        events::learn(node.store_mut(), 0, 42, 1, 0x33).unwrap();

        // short-form events resolve against node number 0
        inject(&mut node, data_frame(9, &[opcodes::ASON, 0, 99, 0, 42]));
        inject(&mut node, data_frame(9, &[opcodes::ASOF, 0, 99, 0, 42]));
        node.process(8);

        assert_eq!(
            seen.borrow().as_slice(),
            &[(0u8, true, 0x33u8), (0u8, false, 0x33u8)]
        );
    }

    #[test]
    fn test_frame_filter_allow_list() {
        let clock = ManualClock::new();
        let store = MemStore::new(8, 3, 4);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .frame_filter(
                move |frame| sink.borrow_mut().push(frame.data[0]),
                vec![opcodes::QNN],
            )
            .build();

        inject(&mut node, data_frame(9, &[opcodes::QNN]));
        inject(&mut node, data_frame(9, &[opcodes::RQNP]));
        node.process(8);

        assert_eq!(seen.borrow().as_slice(), &[opcodes::QNN]);
    }

    #[test]
    fn test_transmit_observer_sees_rewritten_identifier() {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        store.set_local_id(OUR_ID).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .transmit_observer(move |frame| sink.borrow_mut().push(frame.id))
            .build();

        inject(&mut node, data_frame(9, &[opcodes::QNN]));
        node.process(8);

        assert_eq!(
            seen.borrow().as_slice(),
            &[wire_format::encode_id(wire_format::DEFAULT_PRIORITY, OUR_ID)]
        );
        assert_eq!(node.frames_sent(), 1);
    }

    #[test]
    fn test_consume_own_events_loopback() {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        store.set_local_id(OUR_ID).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .event_handler(move |index, _frame| sink.borrow_mut().push(index))
            .consume_own_events(4)
            .build();
        events::learn(node.store_mut(), NN, 7, 1, 0).unwrap();

        // produce our own event; it must come back through the loopback
        let mut event = Frame::with_payload(&[opcodes::ACON, 0, 0, 0, 7]);
        event.set_node_number(NN);
        node.send_frame(event);
        assert_eq!(node.loopback().unwrap().size(), 1);

        node.process(8);
        assert_eq!(seen.borrow().as_slice(), &[0u8]);
        assert_eq!(node.loopback().unwrap().gets(), 1);
    }

    #[test]
    fn test_non_event_sends_do_not_loop_back() {
        let clock = ManualClock::new();
        let mut store = MemStore::new(8, 3, 4);
        store.set_node_number(NN).unwrap();
        let mut node = Dispatcher::builder(MockBus::default(), store, clock)
            .params(test_params())
            .consume_own_events(4)
            .build();

        inject(&mut node, data_frame(9, &[opcodes::QNN]));
        node.process(8);

        assert_eq!(outbound(&node).last().unwrap().data[0], opcodes::PNN);
        assert_eq!(node.loopback().unwrap().size(), 0);
    }

    #[test]
    fn test_revert_to_lean_clears_identity() {
        let (mut node, _clock) = configured_node();
        node.revert_to_lean();

        assert_eq!(outbound(&node)[0].data[0], opcodes::NNREL);
        assert_eq!(nn_bytes(&outbound(&node)[0]), NN);
        assert_eq!(node.node_number(), 0);
        assert_eq!(node.local_id(), 0);
        assert!(!node.store().flexible_mode());
        assert_eq!(node.current_mode(), ModuleMode::Lean);
    }

    #[test]
    fn test_max_frames_bounds_drain() {
        let (mut node, _clock) = configured_node();
        for _ in 0..5 {
            inject(&mut node, data_frame(9, &[opcodes::QNN]));
        }

        node.process(2);
        assert_eq!(outbound(&node).len(), 2);
        assert_eq!(node.frames_received(), 2);

        node.process(8);
        assert_eq!(outbound(&node).len(), 5);
    }
}
