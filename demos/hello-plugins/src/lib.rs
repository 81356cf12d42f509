//! Demo plugin binary
//!
//! Build with `cargo build -p hello-plugins` and copy the resulting
//! `libhello_plugins.so` / `hello_plugins.dll` / `libhello_plugins.dylib` into
//! `<base>/Plugins/`. Each plugin's "window" is a block of console output.

use chrono::{DateTime, Local};
use shadowplug_sdk::{Plugin, PluginResult, declare_plugin};

/// Console window shared by the demo plugins
#[derive(Debug, Default)]
struct ConsoleWindow {
    title: &'static str,
    opened_at: Option<DateTime<Local>>,
    raised: u32,
}

impl ConsoleWindow {
    fn new(title: &'static str) -> Self {
        Self {
            title,
            ..Default::default()
        }
    }

    fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Open the window, or bring it to the front if it is already open
    fn show(&mut self, body: &str) {
        match self.opened_at {
            Some(opened_at) => {
                self.raised += 1;
                println!(
                    "[{}] brought to front (open since {})",
                    self.title,
                    opened_at.format("%H:%M:%S")
                );
            }
            None => {
                self.opened_at = Some(Local::now());
                println!("+-- {} --", self.title);
                for line in body.lines() {
                    println!("| {line}");
                }
                println!("+--");
            }
        }
    }

    fn close(&mut self) {
        if self.opened_at.take().is_some() {
            println!("[{}] closed", self.title);
        }
        self.raised = 0;
    }
}

/// Says hello
pub struct Greeter {
    window: ConsoleWindow,
}

impl Default for Greeter {
    fn default() -> Self {
        Self {
            window: ConsoleWindow::new("Greeter"),
        }
    }
}

impl Plugin for Greeter {
    fn name(&self) -> &str {
        "Greeter"
    }

    fn is_visible(&self) -> bool {
        self.window.is_open()
    }

    fn activate(&mut self) {
        self.window.show("Hello from a shadow-copied plugin!");
    }

    fn close(&mut self) -> PluginResult<()> {
        self.window.close();
        Ok(())
    }
}

/// Shows the local time at the moment it was opened
pub struct Clock {
    window: ConsoleWindow,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            window: ConsoleWindow::new("Clock"),
        }
    }
}

impl Plugin for Clock {
    fn name(&self) -> &str {
        "Clock"
    }

    fn is_visible(&self) -> bool {
        self.window.is_open()
    }

    fn activate(&mut self) {
        let now = Local::now();
        self.window.show(&format!(
            "{}\n{}",
            now.format("%H:%M:%S"),
            now.format("%A, %d %B %Y")
        ));
    }

    fn close(&mut self) -> PluginResult<()> {
        self.window.close();
        Ok(())
    }
}

declare_plugin!(Greeter, Clock);

#[cfg(test)]
mod tests {
    use super::*;
    use shadowplug_sdk::API_VERSION;

    #[test]
    fn test_declaration_lists_both_plugins() {
        assert_eq!(shadowplug_declaration.api_version, API_VERSION);

        let names: Vec<String> = shadowplug_declaration
            .collect()
            .unwrap()
            .iter()
            .map(|ty| ty.instantiate().unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["Greeter", "Clock"]);
    }

    #[test]
    fn test_activate_twice_keeps_one_window() {
        let mut clock = Clock::default();
        assert!(!clock.is_visible());

        clock.activate();
        let opened_at = clock.window.opened_at;
        clock.activate();

        assert!(clock.is_visible());
        assert_eq!(clock.window.opened_at, opened_at);
        assert_eq!(clock.window.raised, 1);
    }

    #[test]
    fn test_close_before_activate_is_safe() {
        let mut greeter = Greeter::default();
        greeter.close().unwrap();
        assert!(!greeter.is_visible());

        greeter.activate();
        greeter.close().unwrap();
        assert!(!greeter.is_visible());
    }
}
