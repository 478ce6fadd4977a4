//! Interactive sstash client.
//!
//! ```text
//! sstash-cli <ip> <port>
//! ```
//!
//! Reads whitespace-separated commands from stdin, frames them as protocol
//! tokens, and prints the decoded reply. Exit codes: 0 normal, 1 argument
//! error, 2 connect failure.

use bytes::BytesMut;
use sstash::protocol::{decode_token, encode_tokens, marker};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn print_help() {
    println!(
        r#"
sstash-cli - Interactive sstash client

USAGE:
    sstash-cli <ip> <port>

COMMANDS (typed at the prompt):
    GET <key> <num_opt_args> [NAME=<name>]
    INFO <num_opt_args> [NAME=<name>]
    SET <key> <value> <num_opt_args> [NAME=<name>]
    SETTTL <key> <value> <ttl_ms> <num_opt_args> [NAME=<name>]
    DELETE <key> <num_opt_args> [NAME=<name>]
    UPDATETTL <key> <ttl_ms> <num_opt_args> [NAME=<name>]
    CREATE <name> <max_key_count> <off_heap>
    DROP <name>
    exit | quit
"#
    );
}

/// Reads one reply off the stream: the marker token, plus the payload
/// token for VALUE and ERROR replies.
async fn read_reply(stream: &mut TcpStream, buffer: &mut BytesMut) -> std::io::Result<String> {
    let mut tokens: Vec<String> = Vec::new();

    loop {
        while let Some((token, consumed)) =
            decode_token(buffer).map_err(std::io::Error::other)?
        {
            let _ = buffer.split_to(consumed);
            let token = String::from_utf8(token.to_vec())
                .map_err(|_| std::io::Error::other("non-UTF-8 reply token"))?;
            tokens.push(token);

            match tokens[0].as_str() {
                marker::OK => return Ok("OK".to_string()),
                marker::VALUE if tokens.len() == 2 => return Ok(tokens[1].clone()),
                marker::ERROR if tokens.len() == 2 => {
                    return Ok(format!("(error) {}", tokens[1]))
                }
                _ => {}
            }
        }

        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help") {
        print_help();
        std::process::exit(0);
    }
    if args.len() != 2 {
        eprintln!("Error: expected <ip> <port>");
        print_help();
        std::process::exit(1);
    }

    let port: u16 = args[1].parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid port: {}", args[1]);
        std::process::exit(1);
    });
    let addr = format!("{}:{}", args[0], port);

    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Error: could not connect to {}: {}", addr, e);
            std::process::exit(2);
        }
    };

    println!("Connected to {}. Type 'exit' to quit.", addr);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        print!("{}> ", addr);
        use std::io::Write;
        std::io::stdout().flush().ok();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                std::process::exit(1);
            }
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [] => continue,
            ["exit"] | ["quit"] => break,
            ["help"] => {
                print_help();
                continue;
            }
            _ => {}
        }

        if let Err(e) = stream.write_all(&encode_tokens(&tokens)).await {
            eprintln!("Error: connection lost: {}", e);
            std::process::exit(2);
        }

        match read_reply(&mut stream, &mut buffer).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => {
                eprintln!("Error: connection lost: {}", e);
                std::process::exit(2);
            }
        }
    }
}
