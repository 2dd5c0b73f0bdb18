// Process entry point: loads a node's static config, wires up one
// NodeRuntime over the full keyspace, and drives it off framed messages
// read from stdin, writing replies to stdout. Physical networking (actual
// socket binding, TLS, discovery) is an external collaborator (spec.md
// §1) -- this is the seam an embedder plugs a real transport into, not
// that transport itself.

use std::io::{self, Read, Write};

use drift::NodeRuntime;
use drift_base::{err, Error, NodeConfig};
use drift_net::NodeID;
use drift_txn::{Key, Range};

const LEN_PREFIX_BYTES: usize = 4;

fn read_frame(mut input: impl Read) -> Result<Option<Box<[u8]>>, Error> {
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    match input.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(Some(buf.into_boxed_slice()))
}

fn write_frame(mut output: impl Write, buf: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(buf.len()).map_err(|_| err("frame too large to send"))?;
    output.write_all(&len.to_be_bytes())?;
    output.write_all(buf)?;
    output.flush()?;
    Ok(())
}

fn run(config: NodeConfig) -> Result<(), Error> {
    let peer = NodeID(config.node_id.wrapping_add(1));
    let mut node = NodeRuntime::new(config, Range::new(Key::from_str(""), None));
    node.start();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut lock_in = stdin.lock();
    let mut tick: u64 = 0;

    while let Some(frame) = read_frame(&mut lock_in)? {
        node.recv_bytes(peer, frame)?;
        node.tick(tick)?;
        tick += 1;
        while let Some((_dst, out)) = node.send_bytes()? {
            write_frame(stdout.lock(), &out)?;
        }
    }

    node.drain();
    Ok(())
}

fn main() -> Result<(), Error> {
    let config_path = std::env::args().nth(1);
    let config = match config_path {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    run(config)
}
