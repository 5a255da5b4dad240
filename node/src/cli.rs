use {clap::Parser, std::net::Ipv6Addr};

/// The node's own link-local IPv6 address (its election identity), and
/// the election port/multicast group it joins on. Taken explicitly on
/// the command line rather than derived from a network interface, since
/// there is no interface-enumeration dependency in this workspace.
#[derive(Debug, Parser)]
pub struct CliOptions {
  #[clap(long, help = "this node's own link-local IPv6 address")]
  pub address: String,

  #[clap(long, default_value_t = 3142, help = "election UDP port")]
  pub port: u16,

  #[clap(
    long,
    default_value = "ff02::1",
    help = "link-local all-nodes multicast group to join"
  )]
  pub multicast_group: Ipv6Addr,

  #[clap(subcommand)]
  pub command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
  /// Print a fixed greeting and exit.
  Hello,
  /// Query the currently known leader and exit.
  Leader,
}
