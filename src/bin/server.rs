//! Example server: a minimal Redis-compatible key-value store on top of
//! the framework, enough for redis-cli and redis-benchmark to talk to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tokio::sync::oneshot;

use resphub::{listen_and_serve, Action, Command, Conn, Hub, Options};

const ADDR: &str = "127.0.0.1:6380";

#[derive(Parser, Debug)]
struct Args {
    /// The address to listen on
    #[arg(short, long, default_value = ADDR)]
    addr: String,
    /// Run one event loop per logical CPU
    #[arg(long)]
    multicore: bool,
}

type Store = Arc<RwLock<HashMap<Bytes, Bytes>>>;

#[tokio::main]
async fn main() -> resphub::Result<()> {
    let _ = tracing_subscriber::fmt().try_init();
    let args = Args::parse();

    let store: Store = Arc::new(RwLock::new(HashMap::new()));

    let hub = Arc::new(Hub::new(
        |_conn| Action::None,
        |_conn, _err| Action::None,
        move |conn, cmd| handle(&store, conn, cmd),
        Some(Duration::from_secs(1)),
        Duration::from_secs(30),
    ));

    let options = Options {
        multicore: args.multicore,
        ticker: true,
        ..Options::default()
    };

    let (boot_tx, _boot_rx) = oneshot::channel();
    listen_and_serve(boot_tx, &args.addr, options, hub).await
}

fn handle(store: &Store, conn: &Conn, cmd: Command) -> Action {
    let name = cmd.name().to_ascii_lowercase();
    match name.as_slice() {
        b"ping" => conn.write_string("PONG"),
        b"quit" => {
            conn.write_string("OK");
            return Action::Close;
        }
        b"set" => {
            if cmd.args.len() != 3 {
                wrong_arity(conn, &cmd);
                return Action::None;
            }
            store
                .write()
                .unwrap()
                .insert(cmd.args[1].clone(), cmd.args[2].clone());
            conn.write_string("OK");
        }
        b"get" => {
            if cmd.args.len() != 2 {
                wrong_arity(conn, &cmd);
                return Action::None;
            }
            match store.read().unwrap().get(&cmd.args[1]) {
                Some(value) => conn.write_bulk(value),
                None => conn.write_null(),
            }
        }
        b"del" => {
            if cmd.args.len() != 2 {
                wrong_arity(conn, &cmd);
                return Action::None;
            }
            let removed = store.write().unwrap().remove(&cmd.args[1]).is_some();
            conn.write_int(if removed { 1 } else { 0 });
        }
        // blank reply that keeps redis-benchmark happy
        b"config" => {
            if cmd.args.len() < 3 {
                wrong_arity(conn, &cmd);
                return Action::None;
            }
            conn.write_array(2);
            conn.write_bulk(&cmd.args[2]);
            conn.write_bulk_string("");
        }
        _ => conn.write_error(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(cmd.name())
        )),
    }
    Action::None
}

fn wrong_arity(conn: &Conn, cmd: &Command) {
    conn.write_error(&format!(
        "ERR wrong number of arguments for '{}' command",
        String::from_utf8_lossy(cmd.name())
    ));
}
