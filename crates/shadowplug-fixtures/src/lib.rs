//! Plugin binary used by the host's native loading tests
//!
//! `Beacon` behaves; `Bomb` panics from inside this binary whenever the host
//! drives it.

use shadowplug_sdk::{Plugin, PluginResult, declare_plugin};

#[derive(Default)]
pub struct Beacon {
    lit: bool,
}

impl Plugin for Beacon {
    fn name(&self) -> &str {
        "Beacon"
    }

    fn is_visible(&self) -> bool {
        self.lit
    }

    fn activate(&mut self) {
        self.lit = true;
    }

    fn close(&mut self) -> PluginResult<()> {
        self.lit = false;
        Ok(())
    }
}

#[derive(Default)]
pub struct Bomb;

impl Plugin for Bomb {
    fn name(&self) -> &str {
        "Bomb"
    }

    fn is_visible(&self) -> bool {
        false
    }

    fn activate(&mut self) {
        panic!("bomb went off");
    }

    fn close(&mut self) -> PluginResult<()> {
        panic!("bomb went off while closing");
    }
}

declare_plugin!(Beacon, Bomb);
