//! A headless host loop.
//!
//! Registers a handful of plugins, runs a few seconds of fixed 16ms ticks,
//! saves a snapshot, reloads it, and shuts down.
//!
//! Run with: `RUST_LOG=plexus=debug cargo run --example headless_host`

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plexus_kernel::prelude::*;

/// Counts gold and rolls loot on a timer.
struct Economy {
    rolls: Rc<RefCell<u32>>,
}

impl Plugin for Economy {
    fn id(&self) -> &str {
        "economy"
    }

    fn init(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        kernel.use_middleware(|cmd, entry, ctx, next| {
            if cmd.kind == "gain-gold" {
                let amount = cmd.payload["amount"].as_i64().unwrap_or(0);
                let mut state = ctx.state().clone();
                let gold = state["gold"].as_i64().unwrap_or(0);
                state["gold"] = json!(gold + amount);
                ctx.set_state(state);
            }
            next.run(cmd, entry, ctx)
        });
        Ok(())
    }

    fn start(&mut self, kernel: &mut Kernel) -> anyhow::Result<()> {
        let rolls = self.rolls.clone();
        kernel.every(
            500.0,
            move |k: &mut Kernel| {
                let amount = k.rng_mut().stream("loot").int(1, 6);
                k.dispatch(Command::new("gain-gold", json!({ "amount": amount })));
                *rolls.borrow_mut() += 1;
                Ok(())
            },
            EveryOptions::default().owned_by("economy"),
        )?;
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("plexus=info".parse()?))
        .init();

    let config = KernelConfig::from_json_str(
        r#"{ "rng_seed": "demo", "clock": { "fixed_step_ms": 16.0 } }"#,
    )?;
    let mut kernel = Kernel::new(config);
    kernel.set_state(json!({ "gold": 0 }), "bootstrap");

    let rolls = Rc::new(RefCell::new(0));
    kernel.register(Economy {
        rolls: rolls.clone(),
    })?;
    kernel.register(
        PluginBuilder::new("hud")
            .requires(&["economy"])
            .on_start(|k| {
                k.on_owned(topics::TICK, "hud", |event: &Event| {
                    if event.payload["ticks"].as_u64().is_some_and(|t| t % 60 == 0) {
                        info!(now = %event.payload["now"], "hud refresh");
                    }
                    Ok(())
                });
                Ok(())
            })
            .build(),
    )?;

    kernel.start()?;
    let order = kernel.resolve_order()?;
    info!(?order, "plugins started");

    // Three seconds of fixed steps; the dt argument is ignored.
    let totals = kernel.run_ticks(188, 0.0);
    info!(
        now = kernel.now(),
        ran = totals.ran,
        rolls = *rolls.borrow(),
        gold = %kernel.state()["gold"],
        "simulation finished"
    );

    let snapshot = kernel.save(json!({ "slot": "autosave" }));
    info!(checksum = %snapshot.checksum, bytes = snapshot.to_json()?.len(), "saved");

    kernel.set_state(json!({ "gold": 0 }), "reset");
    kernel.load(&snapshot, LoadOptions::default())?;
    info!(gold = %kernel.state()["gold"], "restored");

    let replayed = kernel.replay(None);
    info!(commands = replayed.len(), gold = %kernel.state()["gold"], "replayed log");

    let failures = kernel.dispose();
    info!(failures, "shut down");
    Ok(())
}
