use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use unet::{ForwardRule, NetConfig};

#[derive(Parser, Debug)]
#[command(
    name = "unet",
    about = "User-space NAT networking for a VM guest",
    long_about = "Serve a virtual 10.0.2.0/24 network to a hypervisor over a Unix stream socket, \
                  carrying guest traffic out through ordinary host sockets"
)]
pub struct Args {
    /// Unix socket the hypervisor connects to (length-prefixed frames)
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    pub socket: PathBuf,

    /// Port forward from host to guest (format: tcp|udp:[BIND:]HOSTPORT:GUESTPORT)
    #[arg(short = 'f', long = "forward", value_name = "RULE")]
    pub forwards: Vec<ForwardRule>,

    /// Host nameserver behind the DNS alias [default: from /etc/resolv.conf]
    #[arg(long = "dns", value_name = "IP")]
    pub dns: Vec<Ipv4Addr>,

    /// Host address outbound connections are bound to
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<Ipv4Addr>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    pub fn config(&self) -> NetConfig {
        NetConfig {
            dns_servers: self.dns.clone(),
            bind_addr: self.bind,
            forwards: self.forwards.clone(),
            ..NetConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_build_config() {
        let args = Args::parse_from([
            "unet",
            "--socket",
            "/tmp/unet.sock",
            "-f",
            "tcp:2222:22",
            "--forward",
            "udp:127.0.0.1:5353:53",
            "--dns",
            "1.1.1.1",
            "--bind",
            "192.168.1.10",
        ]);
        let cfg = args.config();
        assert_eq!(cfg.forwards.len(), 2);
        assert_eq!(cfg.forwards[0], ForwardRule::tcp(2222, 22));
        assert_eq!(cfg.dns_servers, vec![Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(cfg.bind_addr, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(!args.verbose);
    }

    #[test]
    fn test_bad_forward_is_rejected() {
        assert!(Args::try_parse_from(["unet", "--socket", "x", "--forward", "sctp:1:2"]).is_err());
        assert!(Args::try_parse_from(["unet"]).is_err());
    }
}
