use clap::Parser;
use redlink::{server, Error};
use tokio::net::TcpListener;

const PORT: u16 = 6379;

#[derive(Parser, Debug)]
struct Args {
    /// The port to listen on
    #[arg(short, long, env = "REDLINK_PORT", default_value_t = PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    server::run(listener).await
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test: the assertions share the process environment.
    #[test]
    fn port_resolution_order() {
        let args = Args::try_parse_from(["redlink"]).unwrap();
        assert_eq!(args.port, PORT);

        std::env::set_var("REDLINK_PORT", "7001");
        let args = Args::try_parse_from(["redlink"]).unwrap();
        assert_eq!(args.port, 7001);

        // An explicit flag beats the environment.
        let args = Args::try_parse_from(["redlink", "--port", "7000"]).unwrap();
        assert_eq!(args.port, 7000);
        std::env::remove_var("REDLINK_PORT");
    }
}
