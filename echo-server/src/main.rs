//! TCP echo service built on `tasklets-net`: accepts connections and
//! echoes back whatever each client sends, byte for byte, in order.
//!
//! Exists to give the tasklet runtime a realistic consumer: all protocol
//! logic here is two straight-line step functions, and every bit of
//! concurrency (accept, wait-for-readable, wait-for-writable, cleanup on
//! disconnect) comes from `tasklets`/`tasklets-net`.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use tasklets::{Poller, RunQueue, Tasklet, TaskletMutex};
use tasklets_net::{ServerSocket, Socket, StreamEvent};

const BUF_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[clap(author, version, about = "A tasklet-based TCP echo server")]
struct Cli {
    /// Address(es) to listen on; may be given more than once to bind
    /// several local addresses (e.g. an IPv4 and an IPv6 wildcard).
    #[clap(long = "listen", default_value = "127.0.0.1:7007")]
    listen: Vec<SocketAddr>,

    /// Log each accepted connection's peer address.
    #[clap(short, long)]
    verbose: bool,
}

struct Echoer {
    socket: Socket,
    buf: [u8; BUF_SIZE],
    len: usize,
    pos: usize,
    verbose: bool,
}

fn echo_step(e: &mut Echoer, me: &Tasklet<Echoer>) {
    loop {
        if e.pos == e.len {
            match e.socket.read(&mut e.buf, &me.handle()) {
                Ok(StreamEvent::Ready(n)) => {
                    e.len = n;
                    e.pos = 0;
                }
                Ok(StreamEvent::Waiting) => return,
                Ok(StreamEvent::End) => {
                    if e.verbose {
                        log::info!("connection closed");
                    }
                    me.fini();
                    return;
                }
                Err(err) => {
                    log::warn!("echo connection failed: {err}");
                    me.fini();
                    return;
                }
            }
            continue;
        }

        match e.socket.write(&e.buf[e.pos..e.len], &me.handle()) {
            Ok(StreamEvent::Ready(n)) => e.pos += n,
            Ok(StreamEvent::Waiting) => return,
            Ok(StreamEvent::End) => {
                me.fini();
                return;
            }
            Err(err) => {
                log::warn!("echo connection failed: {err}");
                me.fini();
                return;
            }
        }
    }
}

struct Acceptor {
    server: ServerSocket,
    verbose: bool,
}

fn accept_step(a: &mut Acceptor, me: &Tasklet<Acceptor>) {
    loop {
        match a.server.accept(&me.handle()) {
            Ok(Some(socket)) => {
                if a.verbose {
                    match socket.peer_addr() {
                        Ok(peer) => log::info!("connection from {peer}"),
                        Err(err) => log::warn!("failed to read peer address: {err}"),
                    }
                }

                let mutex = TaskletMutex::new(Echoer {
                    socket,
                    buf: [0; BUF_SIZE],
                    len: 0,
                    pos: 0,
                    verbose: a.verbose,
                });
                let mut guard = mutex.lock();
                let echoer = Tasklet::init(mutex.clone());
                echoer.goto(&mut guard, echo_step);
                drop(guard);
            }
            Ok(None) => return,
            Err(err) => {
                log::error!("accept failed: {err}");
                return;
            }
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let server = match ServerSocket::bind(&cli.listen) {
        Ok(server) => server,
        Err(err) => {
            log::error!("failed to bind listener: {err}");
            return ExitCode::FAILURE;
        }
    };

    match server.local_addrs() {
        Ok(addrs) => {
            for addr in addrs {
                log::info!("listening on {addr}");
            }
        }
        Err(err) => log::warn!("failed to read bound addresses: {err}"),
    }

    // Registering the listener's watched-fd requires the singleton
    // poller to already exist; start it before creating the acceptor.
    Poller::singleton();

    let mutex = TaskletMutex::new(Acceptor {
        server,
        verbose: cli.verbose,
    });
    let mut guard = mutex.lock();
    let acceptor = Tasklet::init(mutex.clone());
    acceptor.goto(&mut guard, accept_step);
    drop(guard);

    // From here, every accept and every echoed byte is driven by the
    // poller thread's own run queue; the main thread just has to stay
    // alive. A run queue of its own that nothing ever enqueues to
    // blocks indefinitely on the same condition variable the poller
    // and worker threads use to wait for runnable work.
    RunQueue::target(Some(RunQueue::create()));
    RunQueue::current()
        .expect("just set a run queue target on this thread")
        .run(true);

    acceptor.stop();
    ExitCode::SUCCESS
}
