//! Minimal EIS server: accepts clients on an `eis-<n>` socket and prints
//! every framed message they send, until SIGINT.
//!
//! Run with `cargo run --example eis-demo-server`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::{process, rc::Rc};

use eibridge::{
    server::{Connection, Listener},
    Sink, Source,
};

// Greeting sent to every client right after accept.
const SERVER_NAME: &[u8] = b"eis-demo-server\0";

fn main() {
    if let Err(err) = run() {
        eprintln!("eis-demo-server: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), eibridge::Error> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())?;

    let listener = Rc::new(Listener::bind_auto()?);
    println!("Listening on {:?}", listener.path());

    let sink = Sink::new()?;
    let listener_source = Source::new(listener.dup_fd()?, {
        let listener = listener.clone();
        let sink = sink.clone();
        move |_| accept_clients(&listener, &sink)
    });
    sink.add_source(&listener_source)?;

    while !stop.load(Ordering::Relaxed) {
        sink.poll(1000)?;
        sink.dispatch()?;
    }

    // The listener callback holds a sink handle; removing the source breaks
    // the cycle so teardown closes everything.
    listener_source.remove();
    sink.dispatch()?;

    println!("Terminating");
    Ok(())
}

fn accept_clients(listener: &Listener, sink: &Sink) {
    loop {
        match listener.accept() {
            Ok(Some(connection)) => {
                println!("New connection: {connection:?}");
                if let Err(err) = connection.send(0, 0, SERVER_NAME, &[]) {
                    eprintln!("Failed to greet client: {err}");
                    continue;
                }
                let source = Source::new(connection.socket_fd(), move |source| {
                    handle_client(&connection, source)
                });
                if let Err(err) = sink.add_source(&source) {
                    eprintln!("Failed to register client: {err}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                eprintln!("Failed to accept connection: {err}");
                break;
            }
        }
    }
}

fn handle_client(connection: &Connection, source: &Rc<Source>) {
    match connection.read() {
        Ok(0) => {
            println!("Client disconnected");
            source.remove();
            return;
        }
        Ok(_) => (),
        Err(rustix::io::Errno::WOULDBLOCK) => return,
        Err(err) => {
            eprintln!("Failed to read from client: {err}");
            source.remove();
            return;
        }
    }
    while let Some(message) = connection.pending_message() {
        match message {
            Ok(message) => {
                println!(
                    "Message: object {} opcode {} ({} payload bytes)",
                    message.object_id,
                    message.opcode,
                    message.payload.len(),
                );
                while let Some(fd) = connection.take_fd() {
                    println!("  with fd: {fd:?}");
                }
            }
            Err(err) => {
                eprintln!("Client protocol error: {err}");
                source.remove();
                return;
            }
        }
    }
}
