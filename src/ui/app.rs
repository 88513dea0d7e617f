use crate::models::{AccountProfile, MonitorMode};
use crate::service::PollReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Dashboard,
    Confirm(ConfirmAction),
    ErrorDialog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    Quit,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub mode: MonitorMode,
    pub profile: Option<AccountProfile>,
    pub status: String,
    /// Kept across failed refreshes so the dashboard shows the last good data.
    pub report: Option<PollReport>,
    pub last_refresh: String,
    pub warnings: Vec<String>,
    pub screen: Screen,
    pub previous_screen: Screen,
    pub confirm_selected: usize,
    pub error_message: String,
}

impl AppState {
    pub fn new(mode: MonitorMode) -> Self {
        Self {
            running: true,
            mode,
            profile: None,
            status: "starting".into(),
            report: None,
            last_refresh: "never".into(),
            warnings: vec![],
            screen: Screen::Dashboard,
            previous_screen: Screen::Dashboard,
            confirm_selected: 0,
            error_message: String::new(),
        }
    }

    pub fn ask_quit(&mut self) {
        self.previous_screen = self.screen.clone();
        self.screen = Screen::Confirm(ConfirmAction::Quit);
        self.confirm_selected = 0;
    }

    pub fn show_error(&mut self, message: String) {
        self.error_message = message;
        self.previous_screen = self.screen.clone();
        self.screen = Screen::ErrorDialog;
    }

    pub fn dismiss(&mut self) {
        self.screen = self.previous_screen.clone();
        self.previous_screen = Screen::Dashboard;
    }
}
