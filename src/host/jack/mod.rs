//! JACK backend.
//!
//! The stream becomes a JACK client; the server owns the clock and drives
//! the process callback, so sample rate and period size are whatever the
//! server runs and an open is refused if the request disagrees. Ports are
//! one per channel (planar float32), registered at probe and wired to the
//! `system:` ports after activation. An xrun notification latches the status
//! flag; a server shutdown detaches the stream asynchronously. Stop requests
//! returned from the user callback are posted as messages and completed by a
//! supervisor thread, never from inside the process callback.

extern crate jack;

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{spawn_stop_supervisor, Direction, StopKind, StreamShared, StreamState};
use crate::{CallbackResult, DeviceInfo, SampleFormat};

impl From<jack::Error> for Error {
    fn from(err: jack::Error) -> Error {
        Error::system(err)
    }
}

const JACK_FORMAT: SampleFormat = SampleFormat::F32;

fn open_client(name: &str) -> Result<jack::Client> {
    let (client, status) = jack::Client::new(name, jack::ClientOptions::NO_START_SERVER)?;
    if status.intersects(jack::ClientStatus::FAILURE) {
        return Err(Error::system(format!(
            "could not connect to the JACK server: {status:?}"
        )));
    }
    Ok(client)
}

enum ClientState {
    /// No client yet, or the previous one was torn down.
    Absent,
    /// Registered but not rolling; ports are parked in the handler.
    Passive {
        client: jack::Client,
        handler: ProcessHandler,
    },
    /// The server is driving the process callback.
    Active(jack::AsyncClient<Notifications, ProcessHandler>),
}

pub(crate) struct JackDriver {
    shared: Arc<StreamShared>,
    state: ClientState,
    supervisor: Option<JoinHandle<()>>,
    client_name: String,
    /// System port offsets requested per direction.
    first_channel: [u32; 2],
    out_port_names: Vec<String>,
    in_port_names: Vec<String>,
}

impl JackDriver {
    pub(crate) fn new() -> Result<JackDriver> {
        Ok(JackDriver {
            shared: StreamShared::new(),
            state: ClientState::Absent,
            supervisor: None,
            client_name: "resound".to_owned(),
            first_channel: [0, 0],
            out_port_names: Vec::new(),
            in_port_names: Vec::new(),
        })
    }

    fn passive_client(&mut self) -> Result<&mut ProcessHandler> {
        if matches!(self.state, ClientState::Absent) {
            let client = open_client(&self.client_name)?;
            let handler = ProcessHandler {
                shared: Arc::clone(&self.shared),
                out_ports: Vec::new(),
                in_ports: Vec::new(),
            };
            self.state = ClientState::Passive { client, handler };
        }
        match &mut self.state {
            ClientState::Passive { handler, .. } => Ok(handler),
            _ => Err(Error::invalid_use("the JACK stream is already running")),
        }
    }
}

impl Driver for JackDriver {
    fn backend(&self) -> BackendId {
        BackendId::Jack
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(1)
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        if device != 0 {
            return Err(Error::invalid_use(format!(
                "device index {device} out of range (1 device)"
            )));
        }
        let probe = open_client(&format!("{}-probe", self.client_name))?;
        let playback = probe.ports(
            Some("system:playback_.*"),
            None,
            jack::PortFlags::empty(),
        );
        let capture = probe.ports(Some("system:capture_.*"), None, jack::PortFlags::empty());
        let rate = probe.sample_rate() as u32;
        Ok(DeviceInfo {
            name: "system".to_owned(),
            output_channels: playback.len() as u32,
            input_channels: capture.len() as u32,
            is_default_output: true,
            is_default_input: true,
            sample_rates: vec![rate],
            native_formats: vec![JACK_FORMAT],
            ..DeviceInfo::default()
        }
        .finish())
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        if request.params.device != 0 {
            return Err(Error::invalid_use("device index out of range"));
        }
        self.client_name = request.options.name().to_owned();
        let shared = Arc::clone(&self.shared);
        let direction = request.direction;
        let channels = request.params.channels;

        self.passive_client()?;

        // The server dictates both clock parameters.
        let (server_rate, server_frames) = match &self.state {
            ClientState::Passive { client, .. } => {
                (client.sample_rate() as u32, client.buffer_size() as u32)
            }
            _ => unreachable!("passive_client just ensured this"),
        };
        if request.sample_rate != server_rate {
            return Err(Error::system(format!(
                "the JACK server runs at {server_rate} Hz, {} Hz requested",
                request.sample_rate
            )));
        }
        if request.buffer_frames != 0 && request.buffer_frames != server_frames {
            return Err(Error::system(format!(
                "the JACK server runs {server_frames}-frame periods, {} requested",
                request.buffer_frames
            )));
        }

        let ClientState::Passive { client, handler } = &mut self.state else {
            unreachable!("passive_client just ensured this");
        };
        let mut names = Vec::with_capacity(channels as usize);
        match direction {
            Direction::Output => {
                for ch in 0..channels {
                    let port =
                        client.register_port(&format!("out_{ch}"), jack::AudioOut::default())?;
                    if let Ok(name) = port.name() {
                        names.push(name);
                    }
                    handler.out_ports.push(port);
                }
                self.out_port_names = names;
            }
            Direction::Input => {
                for ch in 0..channels {
                    let port =
                        client.register_port(&format!("in_{ch}"), jack::AudioIn::default())?;
                    if let Ok(name) = port.name() {
                        names.push(name);
                    }
                    handler.in_ports.push(port);
                }
                self.in_port_names = names;
            }
        }
        self.first_channel[direction.idx()] = request.params.first_channel;

        {
            let mut core = shared.lock();
            core.buffer_frames = server_frames;
            core.sample_rate = server_rate;
            core.n_buffers = 2;
            let ep = &mut core.endpoints[direction.idx()];
            ep.device = 0;
            ep.user_channels = channels;
            ep.device_channels = channels;
            ep.device_format = JACK_FORMAT;
            ep.device_interleaved = false;
            ep.do_byte_swap = false;
            // One server period each way.
            ep.latency = server_frames as u64;
            // The channel offset selects which system ports we wire to, not
            // an offset inside our own port buffers.
            core.setup_direction(direction, 0);
        }
        debug!(
            "jack probe ok: {channels} ports {direction:?}, {server_rate} Hz, \
             {server_frames} frames/period",
        );
        Ok(())
    }

    fn close(&mut self) {
        {
            let mut core = self.shared.lock();
            core.thread_running = false;
            if matches!(core.state, StreamState::Running | StreamState::Stopping) {
                core.state = StreamState::Stopped;
            }
        }
        self.shared.notify();
        if let ClientState::Active(async_client) =
            std::mem::replace(&mut self.state, ClientState::Absent)
        {
            if let Err(err) = async_client.deactivate() {
                warn!("deactivating the JACK client failed: {err}");
            }
        } else {
            self.state = ClientState::Absent;
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        self.out_port_names.clear();
        self.in_port_names.clear();
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.thread_running = true;
            core.pending_stop = None;
        }
        if self.supervisor.is_none() {
            let supervisor = spawn_stop_supervisor(Arc::clone(&self.shared), &self.client_name)
                .map_err(|err| Error::system(format!("could not spawn supervisor: {err}")))?;
            self.supervisor = Some(supervisor);
        }
        match std::mem::replace(&mut self.state, ClientState::Absent) {
            ClientState::Passive { client, handler } => {
                let notifications = Notifications {
                    shared: Arc::clone(&self.shared),
                };
                let async_client = client.activate_async(notifications, handler)?;
                connect_system_ports(
                    async_client.as_client(),
                    &self.out_port_names,
                    &self.in_port_names,
                    self.first_channel,
                );
                self.state = ClientState::Active(async_client);
            }
            ClientState::Active(active) => {
                self.state = ClientState::Active(active);
            }
            ClientState::Absent => {
                return Err(Error::Fail("start on a stream that never opened".into()));
            }
        }
        self.shared.lock().state = StreamState::Running;
        self.shared.notify();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Nothing is buffered beyond the server's own period; draining and
        // discarding coincide.
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }
}

impl Drop for JackDriver {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_system_ports(
    client: &jack::Client,
    out_ports: &[String],
    in_ports: &[String],
    first_channel: [u32; 2],
) {
    let playback = client.ports(Some("system:playback_.*"), None, jack::PortFlags::empty());
    for (i, ours) in out_ports.iter().enumerate() {
        let target = i + first_channel[0] as usize;
        let Some(system) = playback.get(target) else {
            warn!("no system playback port for channel {target}");
            continue;
        };
        if let Err(err) = client.connect_ports_by_name(ours, system) {
            warn!("could not connect {ours} to {system}: {err}");
        }
    }
    let capture = client.ports(Some("system:capture_.*"), None, jack::PortFlags::empty());
    for (i, ours) in in_ports.iter().enumerate() {
        let target = i + first_channel[1] as usize;
        let Some(system) = capture.get(target) else {
            warn!("no system capture port for channel {target}");
            continue;
        };
        if let Err(err) = client.connect_ports_by_name(system, ours) {
            warn!("could not connect {system} to {ours}: {err}");
        }
    }
}

struct Notifications {
    shared: Arc<StreamShared>,
}

impl jack::NotificationHandler for Notifications {
    fn xrun(&mut self, _client: &jack::Client) -> jack::Control {
        if let Some(mut core) = self.shared.try_lock() {
            if core.mode.has_output() {
                core.xrun[0] = true;
            }
            if core.mode.has_input() {
                core.xrun[1] = true;
            }
        }
        jack::Control::Continue
    }

    fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        // The server went away; detach asynchronously. The stream is parked
        // stopped and the next control call reports against that state.
        error!("JACK server shut down ({status:?}): {reason}");
        let mut core = self.shared.lock();
        if matches!(core.state, StreamState::Running | StreamState::Stopping) {
            core.state = StreamState::Stopped;
        }
    }
}

struct ProcessHandler {
    shared: Arc<StreamShared>,
    out_ports: Vec<jack::Port<jack::AudioOut>>,
    in_ports: Vec<jack::Port<jack::AudioIn>>,
}

impl jack::ProcessHandler for ProcessHandler {
    fn process(&mut self, _client: &jack::Client, scope: &jack::ProcessScope) -> jack::Control {
        let Some(mut core) = self.shared.try_lock() else {
            silence(&mut self.out_ports, scope);
            return jack::Control::Continue;
        };
        if core.state != StreamState::Running {
            silence(&mut self.out_ports, scope);
            return jack::Control::Continue;
        }
        let frames = core.buffer_frames as usize;

        if !self.in_ports.is_empty() {
            let target = core.input_read_target();
            for (ch, port) in self.in_ports.iter().enumerate() {
                let source = port.as_slice(scope);
                let base = ch * frames * 4;
                for (i, sample) in source.iter().take(frames).enumerate() {
                    let at = base + i * 4;
                    target[at..at + 4].copy_from_slice(&sample.to_ne_bytes());
                }
            }
            core.finish_input_period();
        }

        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);

        if !self.out_ports.is_empty() {
            let rendered = core.render_output_period();
            for (ch, port) in self.out_ports.iter_mut().enumerate() {
                let target = port.as_mut_slice(scope);
                let base = ch * frames * 4;
                for (i, sample) in target.iter_mut().take(frames).enumerate() {
                    let at = base + i * 4;
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&rendered[at..at + 4]);
                    *sample = f32::from_ne_bytes(raw);
                }
            }
        }

        core.tick_stream_time();
        drop(core);

        match flow {
            CallbackResult::Continue => {}
            CallbackResult::Stop => self.shared.post_stop_request(StopKind::Drain),
            CallbackResult::Abort => self.shared.post_stop_request(StopKind::Discard),
        }
        jack::Control::Continue
    }
}

fn silence(out_ports: &mut [jack::Port<jack::AudioOut>], scope: &jack::ProcessScope) {
    for port in out_ports {
        port.as_mut_slice(scope).fill(0.0);
    }
}
