use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_std::{
    net::{TcpListener, TcpStream},
    prelude::*,
    task,
};

use async_trait::async_trait;

use resol_vbus::BlobBuffer;

use crate::{
    error::{Error, Result},
    frame_decoder::{encode_packet, Packet},
    transport::{DisconnectHandle, Transport, TransportKind},
    update_dispatcher::{BindingProvider, EventPublisher},
    value::Value,
};

pub(crate) const DEVICE_DEFINITION_XML: &str = r#"<vbusSpecification>
  <device id="7E11" name="DeltaSol MX">
    <packet source="0x7E11" destination="0x0010" command="0x0100">
      <field name="Temperature1" offset="0" bitSize="16" signed="true" factor="0.1" unit="°C"/>
      <field name="Relay1" offset="2" bitSize="8" mask="0x7F"/>
      <field name="SystemTime" offset="4" bitSize="16" format="t"/>
    </packet>
    <packet source="0x7E11" destination="0x0015">
      <field name="HeatQuantity" offset="0" bitSize="32" factor="1"/>
    </packet>
  </device>
</vbusSpecification>"#;

/// Wire bytes of a `0x7E11 -> 0x0010` packet with `Temperature1 = 24.5`.
pub(crate) fn temperature_frame() -> Vec<u8> {
    encode_packet(&Packet::new(
        0x7E11,
        0x0010,
        0x0100,
        vec![0xF5, 0x00, 0x01, 0x00, 90, 0x00, 0x00, 0x00],
    ))
}

#[derive(Debug, Default)]
pub(crate) struct RecordingPublisher {
    updates: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    pub(crate) fn updates(&self) -> Vec<(String, Value)> {
        self.updates.lock().unwrap().clone()
    }
}

impl EventPublisher for RecordingPublisher {
    fn post_update(&self, item_name: &str, value: Value) {
        self.updates
            .lock()
            .unwrap()
            .push((item_name.to_string(), value));
    }
}

#[derive(Debug)]
pub(crate) struct StaticBindings {
    items: Vec<(String, String)>,
}

impl StaticBindings {
    pub(crate) fn new(items: &[(&str, &str)]) -> StaticBindings {
        StaticBindings {
            items: items
                .iter()
                .map(|(item, field)| (item.to_string(), field.to_string()))
                .collect(),
        }
    }
}

impl BindingProvider for StaticBindings {
    fn item_names(&self) -> Vec<String> {
        self.items.iter().map(|(item, _)| item.clone()).collect()
    }

    fn field_name(&self, item_name: &str) -> Option<String> {
        self.items
            .iter()
            .find(|(item, _)| item == item_name)
            .map(|(_, field)| field.clone())
    }
}

pub(crate) enum HandshakeOutcome {
    Streaming(TcpStream),
    Rejected,
}

async fn receive_line(stream: &mut TcpStream, buf: &mut BlobBuffer) -> Result<String> {
    loop {
        if let Some(idx) = buf.iter().position(|b| *b == 10) {
            let line = std::str::from_utf8(&buf[0..idx])?.trim().to_string();
            buf.consume(idx + 1);
            return Ok(line);
        }

        let mut chunk = [0u8; 256];
        let len = stream.read(&mut chunk).await?;
        if len == 0 {
            return Err(Error::Read("Reached EOF".into()));
        }

        buf.extend_from_slice(&chunk[0..len]);
    }
}

/// Play the server side of the VBus-over-TCP handshake.
pub(crate) async fn serve_handshake(
    mut stream: TcpStream,
    password: &str,
) -> Result<HandshakeOutcome> {
    let mut buf = BlobBuffer::new();

    stream.write_all(b"+HELLO\r\n").await?;

    loop {
        let line = receive_line(&mut stream, &mut buf).await?;
        let (command, args) = match line.find(' ') {
            Some(idx) => (line[0..idx].to_uppercase(), line[idx..].trim().to_string()),
            None => (line.to_uppercase(), String::new()),
        };

        if command == "PASS" {
            if args == password {
                stream.write_all(b"+OK\r\n").await?;
            } else {
                stream.write_all(b"-ERROR Password mismatch\r\n").await?;
                return Ok(HandshakeOutcome::Rejected);
            }
        } else if command == "DATA" {
            stream.write_all(b"+OK\r\n").await?;
            return Ok(HandshakeOutcome::Streaming(stream));
        } else {
            stream.write_all(b"-ERROR Unknown command\r\n").await?;
        }
    }
}

/// A fake VBus-over-TCP device accepting any number of connections.
#[derive(Debug, Clone)]
pub(crate) struct FakeDevice {
    pub(crate) addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    streaming: Arc<AtomicUsize>,
    max_streaming: Arc<AtomicUsize>,
}

impl FakeDevice {
    /// Start the device. After the handshake it sends `frames`; with
    /// `hold_open` it then keeps the connection open until the client leaves.
    pub(crate) async fn start(
        password: &str,
        frames: Vec<u8>,
        hold_open: bool,
    ) -> Result<FakeDevice> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let device = FakeDevice {
            addr: listener.local_addr()?,
            connections: Arc::new(AtomicUsize::new(0)),
            streaming: Arc::new(AtomicUsize::new(0)),
            max_streaming: Arc::new(AtomicUsize::new(0)),
        };

        let password = password.to_string();
        let server = device.clone();
        task::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(_) => break,
                };

                let server = server.clone();
                let password = password.clone();
                let frames = frames.clone();
                task::spawn(async move {
                    drop(server.serve(stream, &password, &frames, hold_open).await);
                });
            }
        });

        Ok(device)
    }

    async fn serve(
        &self,
        stream: TcpStream,
        password: &str,
        frames: &[u8],
        hold_open: bool,
    ) -> Result<()> {
        self.connections.fetch_add(1, Ordering::SeqCst);

        let mut stream = match serve_handshake(stream, password).await? {
            HandshakeOutcome::Streaming(stream) => stream,
            HandshakeOutcome::Rejected => return Ok(()),
        };

        let now = self.streaming.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_streaming.fetch_max(now, Ordering::SeqCst);

        let result = async {
            stream.write_all(frames).await?;

            if hold_open {
                // Wait for the client to go away.
                let mut buf = [0u8; 64];
                while stream.read(&mut buf).await? > 0 {}
            }

            Result::Ok(())
        }
        .await;

        self.streaming.fetch_sub(1, Ordering::SeqCst);

        result
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn streaming(&self) -> usize {
        self.streaming.load(Ordering::SeqCst)
    }

    pub(crate) fn max_streaming(&self) -> usize {
        self.max_streaming.load(Ordering::SeqCst)
    }

    /// Poll until `streaming()` equals `expected` or two seconds elapsed.
    pub(crate) async fn wait_for_streaming(&self, expected: usize) -> usize {
        for _ in 0..200 {
            if self.streaming() == expected {
                break;
            }
            task::sleep(Duration::from_millis(10)).await;
        }
        self.streaming()
    }
}

#[derive(Debug)]
pub(crate) enum Step {
    Chunk(Vec<u8>),
    Fail,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptState {
    pub(crate) connects: usize,
    pub(crate) disconnects: usize,
    pub(crate) connected: bool,
    pub(crate) failing_connects: usize,
}

/// An in-memory transport replaying a fixed script of chunks and failures.
/// Once the script is exhausted every read waits for its full timeout.
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    steps: VecDeque<Step>,
    state: Arc<Mutex<ScriptState>>,
    handle: DisconnectHandle,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> (ScriptedTransport, Arc<Mutex<ScriptState>>) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        let transport = ScriptedTransport {
            steps: steps.into_iter().collect(),
            state: state.clone(),
            handle: DisconnectHandle::new(),
        };
        (transport, state)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn disconnect_handle(&self) -> DisconnectHandle {
        self.handle.clone()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.handle.is_disconnected() {
            return Err(Error::Cancelled);
        }

        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::Connect("scripted failure".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let step = self.steps.pop_front();
        let result = self
            .handle
            .run(timeout, async move {
                match step {
                    Some(Step::Chunk(bytes)) => Ok(bytes),
                    Some(Step::Fail) => Err(Error::Read("scripted failure".into())),
                    None => {
                        task::sleep(timeout * 2).await;
                        Ok(Vec::new())
                    }
                }
            })
            .await?;

        Ok(result.unwrap_or_default())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}
