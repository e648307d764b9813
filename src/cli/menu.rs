//! Interactive numbered menu.
//!
//! Reads one answer per line. Timer notifications arriving while the menu
//! waits for input are printed as they come.
//!
//! The menu opens behind the password gate. On first use the gate asks for
//! a new password and stays closed until one is stored.

use std::io::Write as _;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Weekday};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use super::display::{Display, MAIN_MENU};
use crate::daemon::{BlockEngine, TimerEvent};
use crate::password::{PasswordError, PasswordFile};
use crate::timeutil::{format_timestamp, parse_duration};
use crate::types::validation::{parse_weekday, parse_weekday_list};
use crate::types::{Schedule, TimeRange};

/// Wrong password attempts allowed before the menu closes.
const PASSWORD_ATTEMPTS: usize = 3;

const SITES_MENU: [&str; 9] = [
    "Show sites",
    "Add site",
    "Delete site",
    "Show per-site blocks",
    "Block one site",
    "Unblock one site",
    "Edit a site's block expiry",
    "Delete per-site entry",
    "Stop blocking all sites",
];

const SCHEDULES_MENU: [&str; 10] = [
    "Show schedules",
    "Add schedule",
    "Edit schedule",
    "Delete schedule",
    "Add day",
    "Delete day",
    "Add time range",
    "Delete time range",
    "Edit start time",
    "Edit end time",
];

/// How the menu was left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuExit {
    /// "Exit" chosen or input closed
    Exit,
    /// "Run in background" chosen
    Background,
    /// Password gate failed
    Denied,
}

/// Interactive menu over a line-oriented input.
pub struct Menu<'a, R> {
    engine: &'a BlockEngine,
    password: PasswordFile,
    input: Lines<R>,
    events: mpsc::UnboundedReceiver<TimerEvent>,
}

impl<'a, R> Menu<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    /// Creates a menu reading answers from `input`.
    pub fn new(
        engine: &'a BlockEngine,
        password: PasswordFile,
        input: R,
        events: mpsc::UnboundedReceiver<TimerEvent>,
    ) -> Self {
        Self {
            engine,
            password,
            input: input.lines(),
            events,
        }
    }

    /// Runs the menu until the user leaves it or input ends.
    pub async fn run(&mut self) -> Result<MenuExit> {
        if !self.unlock().await? {
            return Ok(MenuExit::Denied);
        }

        loop {
            Display::show_menu(self.engine.mode()?);
            let Some(choice) = self.prompt("Enter choice: ").await? else {
                return Ok(MenuExit::Exit);
            };
            let outcome = match choice.as_str() {
                "1" => self.block_now().await,
                "2" => self.block_by_schedule().await,
                "3" => self.show_status(),
                "4" => self.toggle_strict().await,
                "5" => self.sites_menu().await,
                "6" => self.schedules_menu().await,
                "7" => self.change_password().await,
                "8" => return Ok(MenuExit::Background),
                "9" => return Ok(MenuExit::Exit),
                _ => {
                    println!("Invalid option (1-{})", MAIN_MENU.len());
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                Display::show_error(&e.to_string());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// Prints `question` and waits for one line. `None` at end of input.
    async fn prompt(&mut self, question: &str) -> Result<Option<String>> {
        print!("{question}");
        std::io::stdout().flush()?;
        loop {
            tokio::select! {
                line = self.input.next_line() => {
                    return Ok(line?.map(|l| l.trim().to_string()));
                }
                Some(event) = self.events.recv() => {
                    Display::show_timer_event(&event);
                    print!("{question}");
                    std::io::stdout().flush()?;
                }
            }
        }
    }

    /// Like `prompt`, but end of input is an error.
    async fn ask(&mut self, question: &str) -> Result<String> {
        self.prompt(question)
            .await?
            .ok_or_else(|| anyhow::anyhow!("input closed"))
    }

    async fn confirm(&mut self, question: &str) -> Result<bool> {
        let answer = self.ask(&format!("{question} (y/N): ")).await?;
        Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    async fn ask_duration(&mut self, question: &str) -> Result<Duration> {
        let answer = self.ask(question).await?;
        Ok(parse_duration(&answer)?)
    }

    async fn ask_expiry(&mut self) -> Result<DateTime<FixedOffset>> {
        let span = self.ask_duration("Block for (e.g. 30m, 2h): ").await?;
        Ok(self.engine.now() + chrono::Duration::from_std(span)?)
    }

    async fn ask_day(&mut self) -> Result<Weekday> {
        let answer = self.ask("Day (e.g. monday): ").await?;
        Ok(parse_weekday(&answer)?)
    }

    async fn ask_index(&mut self) -> Result<usize> {
        let answer = self.ask("Range number: ").await?;
        answer
            .parse()
            .map_err(|_| anyhow::anyhow!("'{answer}' is not a range number"))
    }

    async fn ask_range(&mut self) -> Result<TimeRange> {
        let start = self.ask("Start time (HH:MM): ").await?;
        let end = self.ask("End time (HH:MM): ").await?;
        Ok(TimeRange::new(&start, &end)?)
    }

    // ------------------------------------------------------------------------
    // Password gate
    // ------------------------------------------------------------------------

    async fn unlock(&mut self) -> Result<bool> {
        if !self.password.exists() {
            return self.create_password().await;
        }
        for _ in 0..PASSWORD_ATTEMPTS {
            let Some(answer) = self.prompt("Enter password: ").await? else {
                return Ok(false);
            };
            match self.password.verify(&answer) {
                Ok(()) => return Ok(true),
                Err(PasswordError::Incorrect) => println!("Incorrect password"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn create_password(&mut self) -> Result<bool> {
        println!("No password set. Please create a password first.");
        let Some(new) = self.prompt("Create new password: ").await? else {
            return Ok(false);
        };
        let Some(confirm) = self.prompt("Confirm password: ").await? else {
            return Ok(false);
        };
        match self.password.set(&new, &confirm) {
            Ok(()) => {
                Display::show_success("Password created");
                Ok(true)
            }
            Err(e @ (PasswordError::Weak(_) | PasswordError::Mismatch)) => {
                Display::show_error(&e.to_string());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn change_password(&mut self) -> Result<()> {
        let current = if self.password.exists() {
            Some(self.ask("Current password: ").await?)
        } else {
            None
        };
        let new = self.ask("New password: ").await?;
        let confirm = self.ask("Confirm password: ").await?;
        match current {
            Some(current) => self.password.change(&current, &new, &confirm)?,
            None => self.password.set(&new, &confirm)?,
        }
        Display::show_success("Password changed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Main actions
    // ------------------------------------------------------------------------

    async fn block_now(&mut self) -> Result<()> {
        let span = self.ask_duration("Block for (e.g. 30m, 2h): ").await?;
        let strict = self.confirm("Enable strict mode?").await?;
        let expiry = self.engine.block_for_duration(span, false).await?;
        if strict {
            self.engine.enter_strict()?;
        }
        Display::show_block_started(&format_timestamp(&expiry));
        Ok(())
    }

    async fn block_by_schedule(&mut self) -> Result<()> {
        self.engine.check_menu_access()?;
        let expiry = self.engine.block_by_schedule(false).await?;
        Display::show_block_started(&format_timestamp(&expiry));
        Ok(())
    }

    fn show_status(&self) -> Result<()> {
        Display::show_status(&self.engine.status()?);
        Ok(())
    }

    async fn toggle_strict(&mut self) -> Result<()> {
        if self.engine.mode()?.is_strict() {
            self.engine.leave_strict()?;
            Display::show_success("Strict mode disabled");
        } else if self
            .confirm("Strict mode keeps blocks running until they end. Continue?")
            .await?
        {
            self.engine.enter_strict()?;
            Display::show_success("Strict mode enabled");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sites
    // ------------------------------------------------------------------------

    async fn sites_menu(&mut self) -> Result<()> {
        self.engine.check_menu_access()?;
        loop {
            Display::show_submenu("Sites", &SITES_MENU);
            let Some(choice) = self.prompt("Enter choice: ").await? else {
                return Ok(());
            };
            let outcome = match choice.as_str() {
                "0" => return Ok(()),
                "1" => {
                    Display::show_sites(&self.engine.config()?.sites);
                    Ok(())
                }
                "2" => self.add_site().await,
                "3" => self.delete_site().await,
                "4" => {
                    Display::show_block_entries(&self.engine.block_entries()?);
                    Ok(())
                }
                "5" => self.block_one_site().await,
                "6" => self.unblock_one_site().await,
                "7" => self.edit_site_expiry().await,
                "8" => self.delete_block_entry().await,
                "9" => self.unblock_all().await,
                _ => {
                    println!("Invalid option");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                Display::show_error(&e.to_string());
            }
        }
    }

    async fn add_site(&mut self) -> Result<()> {
        let url = self.ask("Site to block: ").await?;
        let url = self.engine.add_site(&url)?;
        Display::show_success(&format!("Added {url}"));
        Ok(())
    }

    async fn delete_site(&mut self) -> Result<()> {
        let url = self.ask("Site to delete: ").await?;
        let url = self.engine.remove_site(&url)?;
        Display::show_success(&format!("Deleted {url}"));
        Ok(())
    }

    async fn block_one_site(&mut self) -> Result<()> {
        let url = self.ask("Site: ").await?;
        let expiry = self.ask_expiry().await?;
        let known = self
            .engine
            .block_entries()?
            .iter()
            .any(|entry| entry.url.eq_ignore_ascii_case(url.trim()));
        if !known {
            self.engine.add_block_entry(&url, None)?;
        }
        self.engine.block_site(&url, expiry, false).await?;
        Display::show_block_started(&format_timestamp(&expiry));
        Ok(())
    }

    async fn unblock_one_site(&mut self) -> Result<()> {
        let url = self.ask("Site: ").await?;
        if self.engine.unblock_site(&url).await? {
            Display::show_success(&format!("Unblocked {url}"));
        } else {
            println!("{url} is not blocked");
        }
        Ok(())
    }

    async fn edit_site_expiry(&mut self) -> Result<()> {
        let url = self.ask("Site: ").await?;
        let expiry = self.ask_expiry().await?;
        self.engine.update_site_expiry(&url, expiry, false).await?;
        Display::show_success(&format!("{url} now ends at {}", format_timestamp(&expiry)));
        Ok(())
    }

    async fn delete_block_entry(&mut self) -> Result<()> {
        let url = self.ask("Site: ").await?;
        let entry = self.engine.delete_block_entry(&url).await?;
        Display::show_success(&format!("Deleted {}", entry.url));
        Ok(())
    }

    async fn unblock_all(&mut self) -> Result<()> {
        self.engine.unblock_all().await?;
        Display::show_unblocked();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------------

    async fn schedules_menu(&mut self) -> Result<()> {
        self.engine.check_menu_access()?;
        loop {
            Display::show_submenu("Schedules", &SCHEDULES_MENU);
            let Some(choice) = self.prompt("Enter choice: ").await? else {
                return Ok(());
            };
            let outcome = match choice.as_str() {
                "0" => return Ok(()),
                "1" => {
                    Display::show_schedules(&self.engine.config()?);
                    Ok(())
                }
                "2" => self.add_schedule().await,
                "3" => self.edit_schedule().await,
                "4" => self.delete_schedule().await,
                "5" => self.add_day().await,
                "6" => self.delete_day().await,
                "7" => self.add_range().await,
                "8" => self.delete_range().await,
                "9" => self.edit_range_time(true).await,
                "10" => self.edit_range_time(false).await,
                _ => {
                    println!("Invalid option");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                Display::show_error(&e.to_string());
            }
        }
    }

    async fn ask_schedule(&mut self, name: Option<String>) -> Result<Schedule> {
        let name = match name {
            Some(name) => name,
            None => self.ask("Schedule name: ").await?,
        };
        let days = self.ask("Days (comma separated): ").await?;
        let days = parse_weekday_list(&days)?;
        let range = self.ask_range().await?;
        Ok(Schedule::new(&name, days, &range.start, &range.end)?)
    }

    async fn add_schedule(&mut self) -> Result<()> {
        let schedule = self.ask_schedule(None).await?;
        self.engine
            .update_schedules(|config| config.add_schedule(&schedule))?;
        Display::show_success(&format!("Added schedule {}", schedule.name));
        Ok(())
    }

    async fn edit_schedule(&mut self) -> Result<()> {
        let name = self.ask("Schedule to edit: ").await?;
        let new_name = self.ask("New name (blank keeps the name): ").await?;
        let new_name = if new_name.is_empty() {
            name.clone()
        } else {
            new_name
        };
        let schedule = self.ask_schedule(Some(new_name)).await?;
        self.engine
            .update_schedules(|config| config.edit_schedule(&name, &schedule))?;
        Display::show_success(&format!("Updated schedule {}", schedule.name));
        Ok(())
    }

    async fn delete_schedule(&mut self) -> Result<()> {
        let name = self.ask("Schedule to delete: ").await?;
        self.engine
            .update_schedules(|config| config.remove_schedule(&name))?;
        Display::show_success(&format!("Deleted schedule {name}"));
        Ok(())
    }

    async fn add_day(&mut self) -> Result<()> {
        let day = self.ask_day().await?;
        let range = self.ask_range().await?;
        self.engine
            .update_schedules(|config| config.add_day(day, range))?;
        Display::show_success("Day added");
        Ok(())
    }

    async fn delete_day(&mut self) -> Result<()> {
        let day = self.ask_day().await?;
        self.engine.update_schedules(|config| config.remove_day(day))?;
        Display::show_success("Day deleted");
        Ok(())
    }

    async fn add_range(&mut self) -> Result<()> {
        let day = self.ask_day().await?;
        let range = self.ask_range().await?;
        self.engine.update_schedules(|config| {
            config.add_range(day, range);
            Ok(())
        })?;
        Display::show_success("Time range added");
        Ok(())
    }

    async fn delete_range(&mut self) -> Result<()> {
        let day = self.ask_day().await?;
        let index = self.ask_index().await?;
        let removed = self
            .engine
            .update_schedules(|config| config.remove_range(day, index))?;
        Display::show_success(&format!(
            "Deleted {} - {}",
            removed.start, removed.end
        ));
        Ok(())
    }

    async fn edit_range_time(&mut self, start: bool) -> Result<()> {
        let day = self.ask_day().await?;
        let index = self.ask_index().await?;
        let time = self.ask("New time (HH:MM): ").await?;
        self.engine.update_schedules(|config| {
            if start {
                config.set_range_start(day, index, &time)
            } else {
                config.set_range_end(day, index, &time)
            }
        })?;
        Display::show_success("Time range updated");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::timeutil::FixedClock;
    use crate::types::Mode;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PASSWORD: &str = "Str0ng!pass";

    struct Fixture {
        _dir: TempDir,
        settings: Settings,
        engine: BlockEngine,
        _events: mpsc::UnboundedSender<TimerEvent>,
        events_rx: Option<mpsc::UnboundedReceiver<TimerEvent>>,
    }

    impl Fixture {
        /// A fixture whose password is already set to `PASSWORD`.
        fn new() -> Self {
            let fx = Self::without_password();
            fx.password_file().set(PASSWORD, PASSWORD).unwrap();
            fx
        }

        fn without_password() -> Self {
            let dir = TempDir::new().unwrap();
            let hosts = dir.path().join("hosts");
            fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();
            let settings = Settings::new(dir.path().join("data"))
                .with_hosts_path(hosts)
                .with_poll_interval(Duration::from_millis(10));
            // Monday
            let clock = Arc::new(FixedClock::at("2024-05-06 10:00:00 +0200"));
            let (tx, rx) = mpsc::unbounded_channel();
            let engine = BlockEngine::with_events(&settings, clock, tx.clone());
            engine.ensure_config().unwrap();
            Self {
                _dir: dir,
                settings,
                engine,
                _events: tx,
                events_rx: Some(rx),
            }
        }

        fn password_file(&self) -> PasswordFile {
            PasswordFile::new(self.settings.password_path()).with_cost(4)
        }

        /// Unlocks the menu, then feeds `script`.
        async fn run(&mut self, script: &str) -> MenuExit {
            self.run_raw(&format!("{PASSWORD}\n{script}")).await
        }

        async fn run_raw(&mut self, script: &str) -> MenuExit {
            let rx = self.events_rx.take().unwrap();
            let mut menu = Menu::new(&self.engine, self.password_file(), script.as_bytes(), rx);
            menu.run().await.unwrap()
        }

        fn hosts(&self) -> String {
            fs::read_to_string(&self.settings.hosts_path).unwrap()
        }
    }

    // ------------------------------------------------------------------------
    // Navigation Tests
    // ------------------------------------------------------------------------

    mod navigation_tests {
        use super::*;

        #[tokio::test]
        async fn test_exit_and_background_choices() {
            let mut fx = Fixture::new();
            assert_eq!(fx.run("9\n").await, MenuExit::Exit);

            let mut fx = Fixture::new();
            assert_eq!(fx.run("8\n").await, MenuExit::Background);
        }

        #[tokio::test]
        async fn test_end_of_input_exits() {
            let mut fx = Fixture::new();
            assert_eq!(fx.run("").await, MenuExit::Exit);
        }

        #[tokio::test]
        async fn test_invalid_choices_are_ignored() {
            let mut fx = Fixture::new();
            assert_eq!(fx.run("x\n42\n3\n9\n").await, MenuExit::Exit);
        }
    }

    // ------------------------------------------------------------------------
    // Action Tests
    // ------------------------------------------------------------------------

    mod action_tests {
        use super::*;

        #[tokio::test]
        async fn test_add_site_then_block_now_with_strict() {
            let mut fx = Fixture::new();
            let script = "5\n2\nexample.com\n0\n1\n2h\ny\n9\n";
            assert_eq!(fx.run(script).await, MenuExit::Exit);

            assert!(fx.hosts().contains("127.0.0.1 example.com"));
            assert_eq!(fx.engine.mode().unwrap(), Mode::Strict);
            assert!(fx.engine.registry().contains("combined"));
            fx.engine.registry().cancel_all().await.unwrap();
        }

        #[tokio::test]
        async fn test_strict_mode_locks_sites_menu() {
            let mut fx = Fixture::new();
            fx.engine.add_site("a.com").unwrap();
            fx.engine
                .block_for_duration(Duration::from_secs(3600), false)
                .await
                .unwrap();
            fx.engine.enter_strict().unwrap();

            // The delete is refused, so the remaining answers fall through
            // to the main menu as invalid choices.
            fx.run("5\n3\na.com\n9\n").await;
            assert_eq!(fx.engine.config().unwrap().sites, vec!["a.com"]);
            fx.engine.registry().cancel_all().await.unwrap();
        }

        #[tokio::test]
        async fn test_schedule_editing() {
            let mut fx = Fixture::new();
            let script = "6\n2\nwork\nmonday, friday\n09:00\n17:00\n\
                          7\nmonday\n1800\n1900\n\
                          10\nmonday\n2\n20:00\n0\n9\n";
            fx.run(script).await;

            let config = fx.engine.config().unwrap();
            let monday = config.ranges_for(Weekday::Mon).unwrap();
            assert_eq!(monday.len(), 2);
            assert_eq!(monday[0].name.as_deref(), Some("work"));
            assert_eq!(monday[1].start, "18:00");
            assert_eq!(monday[1].end, "20:00");
            assert_eq!(config.ranges_for(Weekday::Fri).unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_toggle_strict_asks_for_confirmation() {
            let mut fx = Fixture::new();
            fx.run("4\nn\n9\n").await;
            assert_eq!(fx.engine.mode().unwrap(), Mode::Normal);

            let mut fx2 = Fixture::new();
            fx2.run("4\ny\n4\n9\n").await;
            assert_eq!(fx2.engine.mode().unwrap(), Mode::Normal);
        }

        #[tokio::test]
        async fn test_block_one_site() {
            let mut fx = Fixture::new();
            fx.run("5\n5\nreddit.com\n30m\n0\n9\n").await;
            assert!(fx.hosts().contains("127.0.0.1 reddit.com"));
            let entries = fx.engine.block_entries().unwrap();
            assert!(entries[0].currently_blocked);
            fx.engine.registry().cancel_all().await.unwrap();
        }
    }

    // ------------------------------------------------------------------------
    // Password Tests
    // ------------------------------------------------------------------------

    mod password_tests {
        use super::*;

        const NEW: &str = "N3w!secret";

        #[tokio::test]
        async fn test_first_start_creates_password() {
            let mut fx = Fixture::without_password();
            assert_eq!(fx.run_raw(&format!("{NEW}\n{NEW}\n9\n")).await, MenuExit::Exit);
            fx.password_file().verify(NEW).unwrap();
        }

        #[tokio::test]
        async fn test_first_start_denied_without_valid_password() {
            let mut fx = Fixture::without_password();
            assert_eq!(fx.run_raw(&format!("{NEW}\nother\n9\n")).await, MenuExit::Denied);
            assert!(!fx.password_file().exists());

            let mut fx = Fixture::without_password();
            assert_eq!(fx.run_raw("weak\nweak\n9\n").await, MenuExit::Denied);
            assert!(!fx.password_file().exists());
        }

        #[tokio::test]
        async fn test_change_password() {
            let mut fx = Fixture::new();
            fx.run(&format!("7\n{PASSWORD}\n{NEW}\n{NEW}\n9\n")).await;
            fx.password_file().verify(NEW).unwrap();
        }

        #[tokio::test]
        async fn test_gate_denies_after_wrong_attempts() {
            let mut fx = Fixture::new();
            assert_eq!(fx.run_raw("a\nb\nc\n9\n").await, MenuExit::Denied);
        }

        #[tokio::test]
        async fn test_gate_accepts_correct_password() {
            let mut fx = Fixture::new();
            assert_eq!(fx.run_raw(&format!("wrong\n{PASSWORD}\n9\n")).await, MenuExit::Exit);
        }
    }
}
