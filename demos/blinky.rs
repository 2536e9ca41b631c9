//! Two simulated LEDs blinking at different rates, each driven by its own fiber.
//!
//! Run with `RUST_LOG=strand=debug` to also see the scheduler at work.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use strand::this_fiber;
use strand::time::PeriodicTimer;
use tracing_subscriber::EnvFilter;

struct Led {
    name: &'static str,
    lit: Cell<bool>,
}

impl Led {
    fn toggle(&self) {
        self.lit.set(!self.lit.get());
        tracing::info!(led = self.name, lit = self.lit.get(), "toggled");
    }
}

#[strand::main]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let green = Rc::new(Led { name: "green", lit: Cell::new(false) });
    let red = Rc::new(Led { name: "red", lit: Cell::new(false) });

    // sleeping between toggles
    strand::Fiber::builder()
        .name("green")
        .stack_size(16 * 1024)
        .spawn(move || {
            for _ in 0..10 {
                green.toggle();
                this_fiber::sleep_for(Duration::from_millis(250));
            }
        })
        .unwrap();

    // waiting on a drift-free timer
    strand::Fiber::builder()
        .name("red")
        .stack_size(16 * 1024)
        .spawn(move || {
            let mut timer = PeriodicTimer::new(Duration::from_millis(400));
            for _ in 0..6 {
                this_fiber::sleep_for(timer.remaining());
                if timer.execute() > 0 {
                    red.toggle();
                }
            }
        })
        .unwrap();
}
