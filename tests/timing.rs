//! `dt` handed to the model is the measured interval, including injected stalls.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use ncs_emulation::{
    plant::{actuator::ConstantActuator, sensor::SimpleSensor},
    Plant, State, VariableStore,
};

const STALL_TICK: usize = 10;
const STALL: Duration = Duration::from_millis(15);

struct Stalling {
    dts: Arc<Mutex<Vec<Duration>>>,
}

impl State for Stalling {
    fn advance(&mut self, dt: Duration) -> anyhow::Result<()> {
        let mut dts = self.dts.lock().unwrap();
        dts.push(dt);
        if dts.len() == STALL_TICK + 1 {
            thread::sleep(STALL);
        }
        Ok(())
    }
}

#[test]
fn stalled_tick_shows_up_in_the_next_dt() {
    let mut vars = VariableStore::builder();
    vars.sensor("x", 0.0);
    vars.actuator("u", 0.0);
    let store = vars.build().unwrap();

    let dts = Arc::new(Mutex::new(Vec::new()));
    let plant = Plant::builder(store, Box::new(Stalling { dts: dts.clone() }))
        .tick_rate(200)
        .duration(Duration::from_millis(300))
        .sensor("x", 50, Box::new(SimpleSensor))
        .actuator("u", Box::new(ConstantActuator::new(0.0)))
        .build()
        .unwrap();

    let report = plant.run().unwrap();
    let dts = dts.lock().unwrap();

    assert_eq!(dts.len() as u64, report.ticks);
    assert!(dts[STALL_TICK + 1] >= STALL, "dt after stall = {:?}", dts[STALL_TICK + 1]);
    assert!(report.overruns >= 1);

    // dt values tile the run: their sum is the wall time up to the last tick.
    let total: Duration = dts.iter().sum();
    assert!(total <= report.elapsed);
    assert!(report.elapsed - total < Duration::from_millis(20), "gap {:?}", report.elapsed - total);
}
