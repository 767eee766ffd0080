//! SSH-1 Client Example
//!
//! Connects to a legacy SSH-1 server, logs in with a password and runs a
//! single command. Output is streamed to stdout and the remote exit status
//! becomes the process exit code.
//!
//! Usage:
//!   cargo run --example ssh1_client <host:port> <username> <password> <command>
//!
//! Example:
//!   RUST_LOG=tern_proto=debug cargo run --example ssh1_client 10.0.0.5:22 admin secret "uname -a"

use async_trait::async_trait;
use std::env;
use std::io::Write;
use std::sync::Arc;
use tern_platform::{
    Authenticator, Console, HostKeyInfo, IdentityMaterial, Interactor, TerminalSize, TernResult,
};
use tern_proto::ssh1::auth::AuthType;
use tern_proto::ssh1::cipher::CipherKind;
use tern_proto::ssh1::client::{Client, Collaborators};
use tern_proto::ssh1::config::SessionConfig;

struct ArgsAuthenticator {
    username: String,
    password: String,
}

#[async_trait]
impl Authenticator for ArgsAuthenticator {
    fn username(&self) -> String {
        self.username.clone()
    }

    async fn password(&self, _prompt: &str) -> Option<String> {
        Some(self.password.clone())
    }

    async fn challenge_response(&self, _prompt: &str) -> Option<String> {
        None
    }

    fn auth_preferences(&self) -> Vec<u8> {
        vec![AuthType::Password as u8]
    }

    fn cipher_preference(&self) -> u8 {
        CipherKind::TripleDes.id()
    }

    fn identity(&self) -> Option<IdentityMaterial> {
        None
    }

    async fn verify_host_key(&self, host: &str, port: u16, key: &HostKeyInfo) -> TernResult<bool> {
        // A real client checks known_hosts here.
        let prefix = &key.modulus[..key.modulus.len().min(8)];
        println!(
            "  Host key for {}:{}: {} bits, modulus {}...",
            host,
            port,
            key.bits,
            hex::encode(prefix)
        );
        Ok(true)
    }
}

struct StderrInteractor;

#[async_trait]
impl Interactor for StderrInteractor {
    fn report(&self, message: &str) {
        eprintln!("note: {}", message);
    }

    fn alert(&self, message: &str) {
        eprintln!("warning: {}", message);
    }

    async fn prompt_line(&self, _prompt: &str, _echo: bool) -> Option<String> {
        None
    }

    async fn ask_confirmation(&self, _question: &str, default: bool) -> bool {
        default
    }
}

struct StdoutConsole;

impl Console for StdoutConsole {
    fn terminal_type(&self) -> String {
        "dumb".to_string()
    }

    fn terminal_size(&self) -> TerminalSize {
        TerminalSize::new(24, 80)
    }

    fn write_output(&self, data: &[u8]) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn write_error(&self, data: &[u8]) {
        let _ = std::io::stderr().write_all(data);
    }

    fn session_opened(&self, cipher: &str) {
        println!("✓ Session open ({})", cipher);
    }

    fn session_closed(&self, exit_status: Option<u32>) {
        println!("✓ Session closed (exit status {:?})", exit_status);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command>",
            args[0]
        );
        eprintln!("Example: {} 10.0.0.5:22 admin secret \"uname -a\"", args[0]);
        std::process::exit(1);
    }

    let (host, port) = match args[1].rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>()?),
        None => (args[1].clone(), 22),
    };

    let config = SessionConfig::new(host, port).with_command(args[4].clone());
    let collaborators = Collaborators {
        authenticator: Arc::new(ArgsAuthenticator {
            username: args[2].clone(),
            password: args[3].clone(),
        }),
        interactor: Arc::new(StderrInteractor),
        console: Arc::new(StdoutConsole),
    };

    println!("Connecting to {}...", args[1]);
    let client = Client::connect(config, collaborators).await?;

    let status = client.wait_exit().await?;
    std::process::exit(status.map_or(0, |code| code as i32));
}
