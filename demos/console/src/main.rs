//! Line-oriented console driving a Dwarf session through a device bridge.
//!
//! Run with: cargo run -p dwarf-console -- [attach <pid|package> | spawn <package>]
//!
//! The bridge address and agent bundle come from the preferences file.

use std::{path::Path, sync::Arc};

use anyhow::{Context as _, bail};
use dwarf_core::{
    BusEvent, Frontend, Hook, Prefs, Target, hexdump::hexdump, hooks::parse_literal_address,
};
use dwarf_session::SessionController;
use dwarf_transport::BridgePeer;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
commands:
  attach <pid|package>            attach and load the agent
  spawn <package>                 spawn, load the agent, resume
  detach
  hook native <address|expr>
  hook java <class[.method]>
  hook onload <module>
  hooks                           list installed hooks
  read <address> <length>         hexdump target memory
  dump <path> <address> <length>  write target memory to a file
  scan <address> <size> <pattern>
  classes                         enumerate java classes
  methods <class>                 enumerate java methods
  call <api> [json args...]
  context                         show the current context
  quit";

/// Frontend printing every notification to stdout.
struct ConsoleFrontend;

impl Frontend for ConsoleFrontend {
    fn log(&self, text: &str) {
        println!("{text}");
    }

    fn alert(&self, title: &str, detail: &str) {
        eprintln!("!! {title}: {detail}");
    }

    fn on_script_loaded(&self) {
        println!("script loaded");
    }

    fn on_script_destroyed(&self) {
        println!("script destroyed");
    }

    fn on_java_classes_enumeration_match(&self, class_name: &str) {
        println!("  {class_name}");
    }

    fn on_java_classes_enumeration_complete(&self) {
        println!("class enumeration complete");
    }

    fn on_hook_installed(&self, hook: &Hook) {
        println!("hooked {:?} {} @ {:#x}", hook.kind, hook.input, hook.address);
    }

    fn on_onload_hit(&self, module: &str, base: &str) {
        println!("{module} loaded at {base}");
    }

    fn append_data(&self, key: &str, text: &str) {
        println!("[{key}]\n{text}");
    }
}

fn number(arg: Option<&str>, what: &str) -> anyhow::Result<u64> {
    let arg = arg.with_context(|| format!("missing {what}"))?;
    parse_literal_address(arg).with_context(|| format!("invalid {what}: {arg}"))
}

fn length(arg: Option<&str>) -> anyhow::Result<usize> {
    Ok(usize::try_from(number(arg, "length")?)?)
}

async fn run_command(controller: &SessionController, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };

    match command {
        "quit" | "exit" => return Ok(false),
        "help" => println!("{HELP}"),
        "attach" => {
            let target = words.next().context("missing target")?;
            controller.attach(Target::from(target), None).await?;
        }
        "spawn" => {
            let package = words.next().context("missing package")?;
            controller.spawn(package, None).await?;
        }
        "detach" => controller.detach().await,
        "hook" => {
            let kind = words.next().context("missing hook kind")?;
            let input = words.collect::<Vec<_>>().join(" ");
            match kind {
                "native" => {
                    controller.hook_native(&input, None).await?;
                }
                "java" => {
                    controller.hook_java(&input, None).await?;
                }
                "onload" => {
                    if controller.hook_on_load(&input).await?.is_none() {
                        println!("{input} already hooked");
                    }
                }
                other => bail!("unknown hook kind {other}"),
            }
        }
        "hooks" => {
            for kind in [
                dwarf_core::HookKind::Native,
                dwarf_core::HookKind::Java,
                dwarf_core::HookKind::OnLoad,
            ] {
                for hook in controller.hooks().hooks(kind) {
                    println!("{kind:?}\t{}\t{:#x}", hook.input, hook.address);
                }
            }
        }
        "read" => {
            let address = number(words.next(), "address")?;
            let length = length(words.next())?;
            let data = controller.read_memory(address, length).await?;
            println!("{}", hexdump(&data));
        }
        "dump" => {
            let path = words.next().context("missing path")?;
            let address = number(words.next(), "address")?;
            let length = length(words.next())?;
            controller
                .dump_memory(Path::new(path), address, length)
                .await?;
            println!("dumped {length} bytes to {path}");
        }
        "scan" => {
            let address = number(words.next(), "address")?;
            let size = length(words.next())?;
            let pattern = words.collect::<Vec<_>>().join(" ");
            let mut matches = controller.memory_scan(address, size, &pattern).await?;
            let mut found = 0usize;
            while let Some(event) = matches.next().await {
                if let BusEvent::ScanMatch { address, metadata } = event {
                    found += 1;
                    println!("  {address} {metadata}");
                }
            }
            println!("{found} matches");
        }
        "classes" => controller.enumerate_java_classes().await?,
        "methods" => {
            let class_name = words.next().context("missing class")?;
            let methods = controller.enumerate_java_methods(class_name).await?;
            println!("{}", serde_json::to_string_pretty(&methods)?);
        }
        "call" => {
            let api = words.next().context("missing api")?;
            let args = words
                .map(|w| serde_json::from_str(w).unwrap_or_else(|_| Value::String(w.to_string())))
                .collect();
            match controller.agent_call(0, api, args).await {
                Some(reply) => println!("{reply:?}"),
                None => println!("no result"),
            }
        }
        "context" => {
            let context = controller.context();
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        other => bail!("unknown command {other}, try help"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let prefs = Prefs::load_default().context("loading preferences")?;
    tracing::info!(bridge = %prefs.bridge_addr, "Connecting to device bridge");
    let peer = BridgePeer::connect(prefs.bridge_addr.as_str())
        .await
        .with_context(|| format!("connecting to {}", prefs.bridge_addr))?;

    let controller = SessionController::new(Arc::new(peer), Arc::new(ConsoleFrontend), prefs);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        if let Err(e) = run_command(&controller, &args.join(" ")).await {
            tracing::error!("{e:#}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&controller, &line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    controller.detach().await;
    Ok(())
}
