//! Property tests for the scheduler.
//!
//! Random mixes of one-shot and periodic tasks, spread over owners, verify
//! owner cancellation and the catch-up rule for periodic tasks.

use plexus_core::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum TaskOp {
    Once { delay: u16, owner: u8 },
    Every { interval: u16, immediate: bool, owner: u8 },
}

fn task_op_strategy() -> impl Strategy<Value = TaskOp> {
    prop_oneof![
        (0..500u16, 0..3u8).prop_map(|(delay, owner)| TaskOp::Once { delay, owner }),
        (1..200u16, any::<bool>(), 0..3u8).prop_map(|(interval, immediate, owner)| {
            TaskOp::Every {
                interval,
                immediate,
                owner,
            }
        }),
    ]
}

/// Firing counts per owner index.
type Fired = [u32; 3];

fn owner_tag(owner: u8) -> String {
    format!("owner-{owner}")
}

fn schedule(scheduler: &mut Scheduler<Fired>, op: &TaskOp) {
    match *op {
        TaskOp::Once { delay, owner } => {
            scheduler
                .after(
                    f64::from(delay),
                    move |fired: &mut Fired| {
                        fired[owner as usize] += 1;
                        Ok(())
                    },
                    Some(owner_tag(owner).as_str()),
                )
                .unwrap();
        }
        TaskOp::Every {
            interval,
            immediate,
            owner,
        } => {
            let options = EveryOptions {
                immediate,
                owner: Some(owner_tag(owner)),
            };
            scheduler
                .every(
                    f64::from(interval),
                    move |fired: &mut Fired| {
                        fired[owner as usize] += 1;
                        Ok(())
                    },
                    options,
                )
                .unwrap();
        }
    }
}

proptest! {
    #[test]
    fn cancelled_owner_never_fires(
        ops in prop::collection::vec(task_op_strategy(), 1..40),
        steps in prop::collection::vec(1..300u16, 1..20),
    ) {
        let mut scheduler: Scheduler<Fired> = Scheduler::default();
        for op in &ops {
            schedule(&mut scheduler, op);
        }
        scheduler.cancel_owner(&owner_tag(0));
        prop_assert_eq!(scheduler.owner_task_count(&owner_tag(0)), 0);

        let mut fired: Fired = [0; 3];
        let mut now = 0.0;
        for step in steps {
            now += f64::from(step);
            scheduler.set_now(now);
            scheduler.pump(&mut fired);
        }
        prop_assert_eq!(fired[0], 0);
    }

    #[test]
    fn lagging_periodic_task_fires_once_per_pump(
        interval in 1..500u16,
        start in 0..1000u16,
        missed in 1..50u32,
    ) {
        let interval = f64::from(interval);
        let mut scheduler: Scheduler<u32> = Scheduler::default();
        scheduler.set_now(f64::from(start));
        let id = scheduler
            .every(interval, |count: &mut u32| { *count += 1; Ok(()) }, EveryOptions::default())
            .unwrap();

        let now = f64::from(start) + interval * f64::from(missed);
        scheduler.set_now(now);
        let mut count = 0;
        scheduler.pump(&mut count);

        prop_assert_eq!(count, 1);
        let next = scheduler.due_at(id).unwrap();
        prop_assert!(next > now);
        prop_assert!(next - interval <= now);
    }
}
