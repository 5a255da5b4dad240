use {
  crate::cli::{CliOptions, Command},
  bytes::Bytes,
  clap::Parser,
  leaderelect_bus::{Bus, Envelope},
  leaderelect_engine as engine,
  leaderelect_transport as transport,
  metrics_exporter_prometheus::PrometheusBuilder,
  std::time::Duration,
  tracing::info,
  tracing_subscriber::FmtSubscriber,
};

mod cli;

/// Grace period a one-shot `hello`/`leader` invocation waits for the
/// engine and transport tasks to come up before querying them. Not a
/// wait for election convergence.
const ONE_SHOT_GRACE_PERIOD: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing::subscriber::set_global_default(FmtSubscriber::new())?;
  PrometheusBuilder::new()
    .install()
    .expect("failed to install metrics exporter");

  let opts = CliOptions::parse();
  info!(address = %opts.address, port = opts.port, "starting node");

  let bus = Bus::new();
  let (engine_handle, engine_join) = engine::spawn(bus.clone(), engine::config::Config::default());

  engine_handle
    .mailbox()
    .send(Envelope::new(
      engine::msg_type::ANNOUNCE_ADDRESS,
      Bytes::copy_from_slice(opts.address.as_bytes()),
      None,
    ))
    .await?;

  let transport_config = transport::config::Config {
    bind_port: opts.port,
    multicast_group: opts.multicast_group,
    ..Default::default()
  };
  let transport_join = transport::spawn(
    bus.clone(),
    engine_handle.mailbox().task(),
    transport_config,
  )
  .await?;

  match opts.command {
    Some(Command::Hello) => {
      // a fixed greeting, no election state involved.
      println!("MAIN: Hello from the leader election node!");
      Ok(())
    }
    Some(Command::Leader) => {
      tokio::time::sleep(ONE_SHOT_GRACE_PERIOD).await;
      println!(
        "MAIN: The current leader is: {}",
        engine_handle.who_is_leader().await
      );
      Ok(())
    }
    None => {
      tokio::try_join!(engine_join, transport_join)?;
      Ok(())
    }
  }
}
