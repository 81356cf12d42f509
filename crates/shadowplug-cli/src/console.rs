//! Line-oriented presentation of the activation surface

use std::collections::HashSet;
use std::io::Write;

use shadowplug_host::{HostEvent, ItemKind, PluginHost, PluginKey};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Invoke the item with this 1-based number
    Invoke(usize),
    /// Close the plugin behind this 1-based number
    Close(usize),
    Menu,
    Help,
    Quit,
}

fn parse(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let command = match words.next()? {
        "q" | "quit" | "exit" => Command::Quit,
        "m" | "menu" => Command::Menu,
        "h" | "help" | "?" => Command::Help,
        "c" | "close" => Command::Close(words.next()?.parse().ok()?),
        number => Command::Invoke(number.parse().ok()?),
    };
    if words.next().is_some() {
        return None;
    }
    Some(command)
}

/// Read commands from stdin until `q` or end of input
pub async fn run(host: &PluginHost) -> anyhow::Result<()> {
    let event_log = spawn_event_log(host);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_menu(host).await;
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse(&line) {
            Some(Command::Quit) => break,
            Some(Command::Menu) => print_menu(host).await,
            Some(Command::Help) => print_help(),
            Some(Command::Invoke(number)) => {
                let surface = host.activation_items();
                match number.checked_sub(1).and_then(|i| surface.get(i)) {
                    Some(item) => {
                        item.invoke().await;
                        print_menu(host).await;
                    }
                    None => println!("No item {number}"),
                }
            }
            Some(Command::Close(number)) => match plugin_at(host, number) {
                Some(key) => {
                    if let Err(e) = host.close(key).await {
                        println!("{e}");
                    }
                    print_menu(host).await;
                }
                None => println!("Item {number} is not a plugin"),
            },
            None => println!("Unknown command: {} (h for help)", line.trim()),
        }
    }

    event_log.abort();
    Ok(())
}

fn plugin_at(host: &PluginHost, number: usize) -> Option<PluginKey> {
    let surface = host.activation_items();
    match surface.get(number.checked_sub(1)?)?.kind() {
        ItemKind::Plugin(key) => Some(key),
        _ => None,
    }
}

async fn print_menu(host: &PluginHost) {
    let visible: HashSet<PluginKey> = host
        .list()
        .await
        .plugins
        .iter()
        .filter(|p| p.visible)
        .map(|p| p.key)
        .collect();

    println!();
    for (i, item) in host.activation_items().items().iter().enumerate() {
        let marker = match item.kind() {
            ItemKind::Plugin(key) if visible.contains(&key) => " *",
            _ => "",
        };
        println!("{:>3}. {}{}", i + 1, item.label(), marker);
    }
}

fn print_help() {
    println!("  <n>        invoke item n");
    println!("  c <n>      close plugin n");
    println!("  m          show the menu");
    println!("  q          unload everything and quit");
}

fn spawn_event_log(host: &PluginHost) -> JoinHandle<()> {
    let mut events = host.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HostEvent::LoadFailed { path, error }) => {
                    debug!(path = %path.display(), %error, "load failure")
                }
                Ok(event) => debug!(?event, "host event"),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} host events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("3"), Some(Command::Invoke(3)));
        assert_eq!(parse("  c 4 "), Some(Command::Close(4)));
        assert_eq!(parse("q"), Some(Command::Quit));
        assert_eq!(parse("menu"), Some(Command::Menu));
        assert_eq!(parse("?"), Some(Command::Help));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse("reload now"), None);
        assert_eq!(parse("c"), None);
        assert_eq!(parse("c x"), None);
        assert_eq!(parse("3 4"), None);
        assert_eq!(parse("-1"), None);
    }
}
