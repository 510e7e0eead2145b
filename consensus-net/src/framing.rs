//! Length-prefixed framing for the TCP protocols.
//!
//! Wire format: `[len: u32-le][payload: len bytes]`. Both the proposal
//! and catch-up channels carry one bincode-encoded request and one
//! response per connection.

use {
    std::{
        io::{Read, Write},
        net::TcpStream,
    },
    strand_types::{ConsensusError, Result},
};

pub fn write_frame(stream: &mut TcpStream, payload: &[u8], max_size: usize) -> Result<()> {
    if payload.len() > max_size {
        return Err(ConsensusError::NetworkProtocol(format!(
            "frame too large: {} > {max_size}",
            payload.len()
        )));
    }
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn read_frame(stream: &mut TcpStream, max_size: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header) as usize;
    if len > max_size {
        return Err(ConsensusError::NetworkProtocol(format!(
            "peer announced oversized frame: {len} > {max_size}"
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::net::{TcpListener, TcpStream},
    };

    #[test]
    fn test_frame_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            write_frame(&mut stream, b"hello frame", 1024).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        let payload = read_frame(&mut stream, 1024).unwrap();
        assert_eq!(payload, b"hello frame");
        writer.join().unwrap();
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            // Announce more than the reader's cap.
            stream.write_all(&1_000u32.to_le_bytes()).unwrap();
            stream.write_all(&[0u8; 1_000]).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        assert!(read_frame(&mut stream, 100).is_err());
        writer.join().unwrap();

        let mut out = TcpStream::connect(addr);
        if let Ok(stream) = out.as_mut() {
            assert!(write_frame(stream, &[0u8; 200], 100).is_err());
        }
    }
}
