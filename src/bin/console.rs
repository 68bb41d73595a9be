//! Interactive client console.
//!
//! Sends get/put/delete datagrams to one node and prints the first reply.
//! Replies can come from a different node than the one addressed: whichever
//! replica serves the request answers the client directly.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use mesh_kv::console::ConsoleCommand;
use mesh_kv::message::Message;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive mesh-kv client")]
struct Args {
    /// Address of the node to talk to
    #[arg(long)]
    node: SocketAddr,

    /// How long to wait for a reply, in milliseconds
    #[arg(long, default_value_t = 2000)]
    reply_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let wait = Duration::from_millis(args.reply_ms);

    println!("talking to {}; type HELP for commands", args.node);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let request = match command {
            ConsoleCommand::Exit => break,
            ConsoleCommand::Help => {
                print_help();
                continue;
            }
            ConsoleCommand::Get { key } => Message::Get { key },
            ConsoleCommand::Put { key, value } => Message::Put { key, value },
            ConsoleCommand::Delete { key } => Message::Delete { key },
        };

        socket.send_to(&request.encode()?, args.node).await?;
        if matches!(request, Message::Delete { .. }) {
            // deletes are accepted by the cluster but answer nothing
            println!("sent");
            continue;
        }

        match await_reply(&socket, wait).await? {
            Some(Message::GetSuccess { sender, key, value }) => {
                println!("{key} = {value} (from {sender})");
            }
            Some(Message::PutSuccess { sender }) => println!("ok (applied by {sender})"),
            Some(other) => println!("unexpected reply: {other:?}"),
            None => println!(
                "no reply within {}ms (missing key, or the cluster is re-electing)",
                args.reply_ms
            ),
        }
    }
    Ok(())
}

async fn await_reply(socket: &UdpSocket, wait: Duration) -> Result<Option<Message>> {
    let mut buf = vec![0u8; 64 * 1024];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Ok(Message::decode(&buf[..len]).ok()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

fn print_help() {
    println!("commands:");
    println!("  PUT <key> <value>   store a value (alias: p)");
    println!("  GET <key>           fetch a value (alias: g)");
    println!("  DEL <key>           accepted by the cluster, currently a no-op (alias: d)");
    println!("  HELP                this text (alias: h)");
    println!("  EXIT                quit (alias: e)");
}
