use anyhow::Result;
use backflow::prelude::*;
use backflow::{telemetry, ENGINE_NAME, VERSION as LIB_VERSION};
use colored::Colorize;
use parking_lot::Mutex;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }
    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", format!("  {} flowshell", ENGINE_NAME).cyan().bold());
    println!("{}", "-".repeat(64).dimmed());
    println!(
        "          Shell   v{:<8} Library   v{:<8}",
        SHELL_VERSION, LIB_VERSION
    );
    let license_blurb = "
    This software is provided 'as is', without warranty of any kind.
    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.
    ";
    println!("{}", license_blurb.dimmed());
    println!("{}", "-".repeat(64).dimmed());
}

/// Prints every signal it receives and keeps its subscription reachable from
/// the shell.
struct ShellSubscriber {
    handle: usize,
    slot: Arc<Mutex<Option<Subscription>>>,
    initial: u64,
}

impl Subscriber<i64> for ShellSubscriber {
    fn on_subscribe(&mut self, subscription: Subscription) {
        println!("<-- [#{}] onSubscribe", self.handle);
        *self.slot.lock() = Some(subscription.clone());
        if self.initial > 0 {
            subscription.request(self.initial);
        }
    }

    fn on_next(&mut self, item: i64) {
        println!("<-- [#{}] onNext({})", self.handle, item.to_string().green());
    }

    fn on_error(&mut self, error: FlowError) {
        println!("<-- [#{}] {}", self.handle, format!("onError({error})").red());
    }

    fn on_complete(&mut self) {
        println!("<-- [#{}] {}", self.handle, "onComplete".cyan());
    }
}

/// The pipeline being assembled and the subscriptions made from it.
struct Session {
    clock: VirtualClock,
    config: FlowConfig,
    pipeline: Option<Flux<i64>>,
    hub: Option<ConnectableFlux<i64>>,
    connection: Option<Connection<i64>>,
    subscriptions: BTreeMap<usize, Arc<Mutex<Option<Subscription>>>>,
    next_handle: usize,
}

impl Session {
    fn new(config: FlowConfig) -> Self {
        Self {
            clock: VirtualClock::new(),
            config,
            pipeline: None,
            hub: None,
            connection: None,
            subscriptions: BTreeMap::new(),
            next_handle: 0,
        }
    }

    fn clock_ref(&self) -> ClockRef {
        Arc::new(self.clock.clone())
    }

    /// Applies an operator to the current pipeline.
    fn extend(&mut self, op: impl FnOnce(Flux<i64>) -> Flux<i64>) {
        match self.pipeline.take() {
            Some(flux) => {
                self.pipeline = Some(op(flux));
                println!("--> Operator added.");
            }
            None => println!("Error: no source yet. Try 'range' or 'interval' first."),
        }
    }

    fn subscribe(&mut self, initial: u64) {
        let handle = self.next_handle;
        let slot = Arc::new(Mutex::new(None));
        let subscriber = ShellSubscriber {
            handle,
            slot: slot.clone(),
            initial,
        };
        match (&self.hub, &self.pipeline) {
            (Some(hub), _) => hub.subscribe_with(subscriber),
            (None, Some(flux)) => flux.subscribe_with(subscriber),
            (None, None) => {
                println!("Error: nothing to subscribe to. Try 'range' or 'interval' first.");
                return;
            }
        }
        self.subscriptions.insert(handle, slot);
        self.next_handle += 1;
        println!("--> Subscribed with handle #{}", handle);
    }

    fn subscription(&self, handle: usize) -> Option<Subscription> {
        self.subscriptions
            .get(&handle)
            .and_then(|slot| slot.lock().clone())
    }

    fn reset(&mut self) {
        for slot in self.subscriptions.values() {
            let subscription = slot.lock().clone();
            if let Some(subscription) = subscription {
                subscription.cancel();
            }
        }
        if let Some(connection) = self.connection.take() {
            connection.dispose();
        }
        self.pipeline = None;
        self.hub = None;
        self.subscriptions.clear();
        self.next_handle = 0;
    }
}

/// Interval ticks as shell items, saturating past `i64::MAX`.
fn tick_value(tick: u64) -> i64 {
    i64::try_from(tick).unwrap_or(i64::MAX)
}

fn parse<T: std::str::FromStr>(arg: Option<&&str>) -> Option<T> {
    arg.and_then(|s| s.parse().ok())
}

fn print_help() {
    println!("Available commands:");
    println!("  range <START> <COUNT>   - Sets the source to a range of integers.");
    println!("  interval <MS>           - Sets the source to a virtual-time interval.");
    println!("  map <FACTOR>            - Multiplies every item by FACTOR.");
    println!("  take <N>                - Keeps the first N items.");
    println!("  limit <N>               - Requests upstream in chunks of N.");
    println!("  delay <MS>              - Delays every item by MS of virtual time.");
    println!("  log                     - Traces every signal of the pipeline.");
    println!("  publish                 - Shares the pipeline through a hub.");
    println!("  connect / disconnect    - Connects or disposes the hub's upstream.");
    println!("  subscribe [N]           - Subscribes, requesting N items (default: unbounded).");
    println!("  request <H> <N>         - Requests N more items on handle H.");
    println!("  cancel <H>              - Cancels handle H.");
    println!("  advance <MS>            - Advances the virtual clock.");
    println!("  status                  - Shows the clock, hub and handles.");
    println!("  reset                   - Cancels everything and starts over.");
    println!("  exit                    - Quits the shell.");
}

fn main() -> Result<()> {
    print_banner();

    let config = FlowConfig::load(None)?;
    telemetry::init(&config.logging)?;

    let mut session = Session::new(config);
    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    info!("{} shell ready on a virtual clock", ENGINE_NAME.cyan());
    println!("Type 'help' for commands or 'exit' to quit.");

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        let line = match rl.readline(&prompt) {
            Ok(line) => line,
            Err(_) => {
                println!("Exiting flowshell...");
                break;
            }
        };
        rl.add_history_entry(line.as_str())?;
        let args = line.split_whitespace().collect::<Vec<_>>();
        let Some(command) = args.first() else {
            continue;
        };

        match *command {
            "range" => match (parse::<i64>(args.get(1)), parse::<u64>(args.get(2))) {
                (Some(start), Some(count)) => {
                    session.reset();
                    session.pipeline = Some(Flux::range(start, count));
                    println!("--> Source set: range({start}, {count})");
                }
                _ => println!("Usage: range <START> <COUNT>"),
            },
            "interval" => match parse::<u64>(args.get(1)) {
                Some(ms) => {
                    session.reset();
                    let ticks = Flux::interval_with(
                        Duration::from_millis(ms),
                        session.clock_ref(),
                        session.config.interval_overflow,
                    );
                    session.pipeline = Some(ticks.map(tick_value));
                    println!("--> Source set: interval({ms}ms)");
                }
                None => println!("Usage: interval <MS>"),
            },
            "map" => match parse::<i64>(args.get(1)) {
                Some(factor) => session.extend(|flux| flux.map(move |v| v * factor)),
                None => println!("Usage: map <FACTOR>"),
            },
            "take" => match parse::<u64>(args.get(1)) {
                Some(n) => session.extend(|flux| flux.take(n)),
                None => println!("Usage: take <N>"),
            },
            "limit" => match parse::<u64>(args.get(1)) {
                Some(n) => session.extend(|flux| flux.limit_rate(n)),
                None => println!("Usage: limit <N>"),
            },
            "delay" => match parse::<u64>(args.get(1)) {
                Some(ms) => {
                    let clock = session.clock_ref();
                    session.extend(|flux| flux.delay_elements_on(Duration::from_millis(ms), clock));
                }
                None => println!("Usage: delay <MS>"),
            },
            "log" => session.extend(|flux| flux.log_named("flowshell")),
            "publish" => match session.pipeline.clone() {
                Some(flux) => {
                    session.hub = Some(flux.publish_with(session.config.hub_overflow));
                    println!("--> Pipeline published. Subscribe, then 'connect'.");
                }
                None => println!("Error: no pipeline to publish."),
            },
            "connect" => match &session.hub {
                Some(hub) => {
                    session.connection = Some(hub.connect());
                    println!("--> Hub is {:?}", hub.phase());
                }
                None => println!("Error: no hub. Use 'publish' first."),
            },
            "disconnect" => match session.connection.take() {
                Some(connection) => {
                    connection.dispose();
                    println!("--> Hub upstream disposed.");
                }
                None => println!("Error: the hub is not connected."),
            },
            "subscribe" => match args.get(1) {
                Some(arg) => match arg.parse::<u64>() {
                    Ok(n) => session.subscribe(n),
                    Err(_) => println!("Error: '{}' is not a valid demand.", arg),
                },
                None => session.subscribe(UNBOUNDED),
            },
            "request" => match (parse::<usize>(args.get(1)), parse::<u64>(args.get(2))) {
                (Some(handle), Some(n)) => match session.subscription(handle) {
                    Some(subscription) => subscription.request(n),
                    None => println!("Error: invalid handle #{}.", handle),
                },
                _ => println!("Usage: request <HANDLE> <N>"),
            },
            "cancel" => match parse::<usize>(args.get(1)) {
                Some(handle) => match session.subscription(handle) {
                    Some(subscription) => {
                        subscription.cancel();
                        println!("--> Handle #{} cancelled.", handle);
                    }
                    None => println!("Error: invalid handle #{}.", handle),
                },
                None => println!("Usage: cancel <HANDLE>"),
            },
            "advance" => match parse::<u64>(args.get(1)) {
                Some(ms) => {
                    let fired = session.clock.advance(Duration::from_millis(ms));
                    println!(
                        "--> Clock at {:?}, {} timer(s) fired.",
                        session.clock.now(),
                        fired
                    );
                }
                None => println!("Usage: advance <MS>"),
            },
            "status" => {
                println!("Clock: {:?} ({} pending)", session.clock.now(), session.clock.pending_timers());
                if let Some(hub) = &session.hub {
                    println!(
                        "Hub: {:?}, {} attached, overflow {:?}",
                        hub.phase(),
                        hub.subscriber_count(),
                        hub.overflow_policy()
                    );
                }
                println!("Handles:");
                for handle in session.subscriptions.keys() {
                    println!("  #{}", handle);
                }
            }
            "reset" => {
                session.reset();
                println!("--> Session reset.");
            }
            "help" => print_help(),
            "exit" => break,
            _ => println!("Unknown command: '{}'. Type 'help'.", line.trim()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_saturate_instead_of_wrapping() {
        assert_eq!(tick_value(7), 7);
        assert_eq!(tick_value(i64::MAX as u64), i64::MAX);
        assert_eq!(tick_value(u64::MAX), i64::MAX);
    }

    #[test]
    fn cancel_reaches_a_recorded_subscription() {
        let mut session = Session::new(FlowConfig::default());
        session.pipeline = Some(Flux::range(0, 100));
        session.subscribe(2);

        let subscription = session.subscription(0).unwrap();
        subscription.cancel();
        assert!(session.subscription(1).is_none());
        session.reset();
        assert!(session.subscriptions.is_empty());
    }
}
