#![windows_subsystem = "windows"]

mod localization;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use iced::alignment::{Horizontal, Vertical};
use iced::executor;
use iced::time;
use iced::widget::{button, Column, Container, ProgressBar, Row, Scrollable, Text, TextInput};
use iced::{Element, Length, Subscription, Task, Theme};
use localization::{number, Localizer};
use tunefetch_core::auth::{AuthEvent, AuthHandle, PkceAuthenticator, ReauthFlow};
use tunefetch_core::config::{Config, LogSettings, ThemePreference};
use tunefetch_core::dependency::check_helper;
use tunefetch_core::download::{
    Collaborators, DownloadService, FailureKind, JobHandle, JobPhase, ProgressEvent,
};
use tunefetch_core::error::RequestError;
use tunefetch_core::history::HistoryTracker;
use tunefetch_core::logging::{LogManager, LogManagerBuilder};
use tunefetch_core::reporter::ProgressReporter;
use tunefetch_core::session::{CredentialStore, SessionCell};
use tunefetch_core::template;

const TICK_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> iced::Result {
    iced::application(TunefetchApp::title, TunefetchApp::update, TunefetchApp::view)
        .subscription(TunefetchApp::subscription)
        .theme(TunefetchApp::theme)
        .executor::<executor::Default>()
        .run_with(TunefetchApp::initialize)
}

enum TunefetchApp {
    Loading(Localizer),
    Ready(Box<AppState>),
    Failed(String),
}

struct AppState {
    service: Arc<DownloadService>,
    reauth: ReauthFlow,
    config: Config,
    config_path: PathBuf,
    localizer: Localizer,
    _log_manager: Option<LogManager>,
    reference_input: String,
    template_input: String,
    template_error: Option<String>,
    status_line: Option<String>,
    needs_login: bool,
    active: Option<ActiveJob>,
    last_phase: JobPhase,
    progress: Option<(usize, usize)>,
    login: Option<AuthHandle>,
    history: HistoryTracker,
}

struct ActiveJob {
    handle: JobHandle,
    reporter: Option<ProgressReporter>,
}

#[derive(Debug, Clone)]
enum Message {
    ReferenceChanged(String),
    TemplateChanged(String),
    SaveTemplate,
    StartDownload,
    CancelDownload,
    Login,
    CancelLogin,
    Tick,
    InitializationComplete(Result<Arc<AppInit>, String>),
}

struct AppInit {
    service: Arc<DownloadService>,
    reauth: ReauthFlow,
    config: Config,
    config_path: PathBuf,
    log_manager: Option<LogManager>,
    warning: Option<String>,
}

impl Clone for AppInit {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            reauth: self.reauth.clone(),
            config: self.config.clone(),
            config_path: self.config_path.clone(),
            log_manager: None, // LogManager is not cloneable, so we set it to None
            warning: self.warning.clone(),
        }
    }
}

impl std::fmt::Debug for AppInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppInit")
            .field("config_path", &self.config_path)
            .field("warning", &self.warning)
            .finish()
    }
}

impl TunefetchApp {
    fn initialize() -> (Self, Task<Message>) {
        let (config, config_path) = match Config::load_or_default(None) {
            Ok(loaded) => loaded,
            Err(err) => {
                return (
                    TunefetchApp::Failed(format!("Failed to load config: {}", err)),
                    Task::none(),
                )
            }
        };

        let localizer = Localizer::new(&config.general.language);

        (
            TunefetchApp::Loading(localizer),
            Task::perform(async_initialize(config, config_path), |result| {
                Message::InitializationComplete(
                    result.map(Arc::new).map_err(|err| format!("{err:#}")),
                )
            }),
        )
    }

    fn title(&self) -> String {
        match self {
            TunefetchApp::Failed(_) => "Tunefetch".into(),
            TunefetchApp::Ready(state) => state.localizer.text("app-title"),
            TunefetchApp::Loading(localizer) => localizer.text("app-title"),
        }
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match self {
            TunefetchApp::Failed(_) => Task::none(),
            TunefetchApp::Ready(state) => state.update(message),
            TunefetchApp::Loading(_) => {
                if let Message::InitializationComplete(result) = message {
                    *self = match result {
                        Ok(init) => {
                            let init = Arc::try_unwrap(init).unwrap_or_else(|arc| (*arc).clone());
                            TunefetchApp::Ready(Box::new(AppState::from(init)))
                        }
                        Err(error) => TunefetchApp::Failed(error),
                    };
                }
                Task::none()
            }
        }
    }

    fn view(&self) -> Element<'_, Message> {
        match self {
            TunefetchApp::Failed(error) => centered(Text::new(error.clone()).into()),
            TunefetchApp::Ready(state) => state.view(),
            TunefetchApp::Loading(localizer) => {
                centered(Text::new(localizer.text("loading")).size(24).into())
            }
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        match self {
            TunefetchApp::Ready(_) => time::every(TICK_INTERVAL).map(|_| Message::Tick),
            TunefetchApp::Loading(_) | TunefetchApp::Failed(_) => Subscription::none(),
        }
    }

    fn theme(&self) -> Theme {
        match self {
            TunefetchApp::Ready(state) => match state.config.general.theme {
                ThemePreference::Light => Theme::Light,
                ThemePreference::Dark => Theme::Dark,
                ThemePreference::System => Theme::default(),
            },
            TunefetchApp::Loading(_) | TunefetchApp::Failed(_) => Theme::default(),
        }
    }
}

impl AppState {
    fn from(init: AppInit) -> Self {
        let localizer = Localizer::new(&init.config.general.language);
        let needs_login = !init.service.sessions().is_present();
        Self {
            template_input: init.config.download.output_template.clone(),
            service: init.service,
            reauth: init.reauth,
            config: init.config,
            config_path: init.config_path,
            localizer,
            _log_manager: init.log_manager,
            reference_input: String::new(),
            template_error: None,
            status_line: init.warning,
            needs_login,
            active: None,
            last_phase: JobPhase::Idle,
            progress: None,
            login: None,
            history: HistoryTracker::new(),
        }
    }

    fn is_running(&self) -> bool {
        self.active.is_some()
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::ReferenceChanged(value) => {
                self.reference_input = value;
            }
            Message::TemplateChanged(value) => {
                self.template_error = template::validate(&value).err().map(|err| {
                    self.localizer
                        .text_with("error-template", &[("reason", err.to_string().into())])
                });
                self.template_input = value;
            }
            Message::SaveTemplate => self.save_template(),
            Message::StartDownload => self.start_download(),
            Message::CancelDownload => {
                if let Some(active) = &self.active {
                    active.handle.cancel();
                }
            }
            Message::Login => self.start_login(),
            Message::CancelLogin => {
                if let Some(login) = &self.login {
                    login.cancel();
                }
            }
            Message::Tick => {
                self.poll_job();
                self.poll_login();
            }
            Message::InitializationComplete(_) => {
                // Handled in the top-level update
            }
        }
        Task::none()
    }

    fn start_download(&mut self) {
        if self.is_running() {
            return;
        }
        match self.service.start(&self.reference_input) {
            Ok(handle) => {
                tracing::info!("started job {} for {}", handle.id, handle.reference);
                let reporter = handle.take_reporter();
                self.active = Some(ActiveJob { handle, reporter });
                self.last_phase = JobPhase::Idle;
                self.progress = None;
                self.status_line = None;
            }
            Err(error) => {
                if error == RequestError::NotLoggedIn {
                    self.needs_login = true;
                }
                self.status_line = Some(self.localizer.text(request_error_key(error)));
            }
        }
    }

    fn save_template(&mut self) {
        if let Err(err) = template::validate(&self.template_input) {
            self.template_error = Some(
                self.localizer
                    .text_with("error-template", &[("reason", err.to_string().into())]),
            );
            return;
        }

        self.config.download.output_template = self.template_input.clone();
        self.service.update_config(self.config.clone());
        self.status_line = Some(match self.config.save(&self.config_path) {
            Ok(()) => self.localizer.text("template-saved"),
            Err(err) => {
                tracing::error!("failed to save config: {err}");
                self.localizer
                    .text_with("error-save-config", &[("reason", err.to_string().into())])
            }
        });
    }

    fn start_login(&mut self) {
        if self.login.is_some() {
            return;
        }
        self.login = Some(self.reauth.start());
        self.status_line = Some(self.localizer.text("status-login-waiting"));
    }

    fn poll_job(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        self.last_phase = active.handle.phase();

        let mut events = Vec::new();
        let mut closed = active.reporter.is_none();
        if let Some(reporter) = active.reporter.as_mut() {
            reporter.drain_into(&mut self.history, &mut |event: &ProgressEvent| {
                events.push(event.clone())
            });
            closed = reporter.is_finished();
        }

        let mut terminal = false;
        for event in events {
            terminal |= event.is_terminal();
            self.apply(event);
        }
        if terminal || closed {
            if !terminal {
                tracing::warn!("download job ended without a final event");
                self.last_phase = JobPhase::Failed;
                self.status_line = Some(self.localizer.text("status-job-lost"));
            }
            self.active = None;
        }
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started => {}
            ProgressEvent::ItemProgress { index, total } => {
                self.progress = Some((index + 1, total));
            }
            ProgressEvent::ItemDone { name, .. } => {
                self.status_line = Some(
                    self.localizer
                        .text_with("status-item-done", &[("name", name.into())]),
                );
            }
            ProgressEvent::ItemSkipped { index, reason } => {
                self.status_line = Some(self.localizer.text_with(
                    "status-item-skipped",
                    &[("index", number(index + 1)), ("reason", reason.into())],
                ));
            }
            ProgressEvent::JobDone => {
                self.last_phase = JobPhase::Completed;
                self.reference_input.clear();
            }
            ProgressEvent::JobFailed { kind, reason } => {
                self.last_phase = JobPhase::Failed;
                self.status_line = Some(if kind == FailureKind::Authentication {
                    self.needs_login = true;
                    self.localizer.text("status-login-required")
                } else {
                    self.localizer
                        .text_with("status-failed", &[("reason", reason.into())])
                });
            }
            ProgressEvent::JobCancelled => {
                self.last_phase = JobPhase::Cancelled;
            }
        }
    }

    fn poll_login(&mut self) {
        let Some(login) = self.login.as_mut() else {
            return;
        };
        let mut finished = false;
        while let Some(event) = login.try_next() {
            match event {
                AuthEvent::OpenBrowser { url } => {
                    if let Err(err) = open_in_browser(&url) {
                        tracing::error!("Failed to open browser: {}", err);
                    }
                    self.status_line = Some(
                        self.localizer
                            .text_with("status-login-open", &[("url", url.into())]),
                    );
                }
                AuthEvent::Succeeded => {
                    self.needs_login = false;
                    self.status_line = Some(self.localizer.text("status-login-succeeded"));
                    finished = true;
                }
                AuthEvent::Failed { reason } => {
                    self.needs_login = true;
                    self.status_line = Some(
                        self.localizer
                            .text_with("status-login-failed", &[("reason", reason.into())]),
                    );
                    finished = true;
                }
            }
        }
        if finished {
            self.login = None;
        }
    }

    fn view(&self) -> Element<'_, Message> {
        let running = self.is_running();
        let localizer = &self.localizer;

        let mut reference = TextInput::new(
            &localizer.text("input-reference-label"),
            &self.reference_input,
        )
        .padding(8)
        .width(Length::Fill);
        if !running {
            reference = reference
                .on_input(Message::ReferenceChanged)
                .on_submit(Message::StartDownload);
        }

        let mut input_row = Row::new().spacing(8).push(reference).push(
            button(Text::new(localizer.text("button-download")))
                .on_press_maybe((!running).then_some(Message::StartDownload)),
        );
        if running {
            input_row = input_row.push(
                button(Text::new(localizer.text("button-cancel")))
                    .on_press(Message::CancelDownload),
            );
        }

        let mut template = TextInput::new(
            &localizer.text("input-template-label"),
            &self.template_input,
        )
        .padding(8)
        .width(Length::Fill);
        if !running {
            template = template
                .on_input(Message::TemplateChanged)
                .on_submit(Message::SaveTemplate);
        }
        let template_row = Row::new().spacing(8).push(template).push(
            button(Text::new(localizer.text("button-save-template"))).on_press_maybe(
                (!running && self.template_error.is_none()).then_some(Message::SaveTemplate),
            ),
        );

        let mut column = Column::new()
            .spacing(12)
            .push(input_row)
            .push(template_row);

        if let Some(error) = &self.template_error {
            column = column.push(Text::new(error.clone()).size(12));
        }

        column = column.push(Text::new(self.phase_label()).size(16));
        if let Some((current, total)) = self.progress {
            let fraction = if total > 0 {
                current as f32 / total as f32
            } else {
                0.0
            };
            column = column.push(ProgressBar::new(0.0..=1.0, fraction.clamp(0.0, 1.0)));
        }
        if let Some(status) = &self.status_line {
            column = column.push(Text::new(status.clone()).size(12));
        }

        if self.login.is_some() {
            column = column.push(
                button(Text::new(localizer.text("button-cancel-login")))
                    .on_press(Message::CancelLogin),
            );
        } else if self.needs_login {
            column = column.push(
                button(Text::new(localizer.text("button-login"))).on_press(Message::Login),
            );
        }

        column = column.push(Text::new(localizer.text("history-title")).size(16));
        if self.history.is_empty() {
            column = column.push(Text::new(localizer.text("history-empty")));
        } else {
            let mut entries = Column::new().spacing(4);
            for entry in self.history.entries() {
                entries = entries.push(
                    Text::new(format!(
                        "{}  {}",
                        entry.timestamp.format("%H:%M:%S"),
                        entry.name
                    ))
                    .size(12),
                );
            }
            column = column.push(Scrollable::new(entries).height(Length::Fill));
        }

        Container::new(column.padding(16))
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn phase_label(&self) -> String {
        let localizer = &self.localizer;
        match self.last_phase {
            JobPhase::Idle => localizer.text("phase-idle"),
            JobPhase::Validating => localizer.text("phase-validating"),
            JobPhase::Resolving => localizer.text("phase-resolving"),
            JobPhase::Downloading(index) => {
                let total = self.progress.map(|(_, total)| total).unwrap_or(0);
                localizer.text_with(
                    "phase-downloading",
                    &[("current", number(index + 1)), ("total", number(total))],
                )
            }
            JobPhase::Completed => localizer.text("phase-completed"),
            JobPhase::Failed => localizer.text("phase-failed"),
            JobPhase::Cancelled => localizer.text("phase-cancelled"),
        }
    }
}

fn centered(content: Element<'_, Message>) -> Element<'_, Message> {
    Container::new(content)
        .width(Length::Fill)
        .height(Length::Fill)
        .align_x(Horizontal::Center)
        .align_y(Vertical::Center)
        .padding(48)
        .into()
}

fn request_error_key(error: RequestError) -> &'static str {
    match error {
        RequestError::EmptyReference => "error-empty-reference",
        RequestError::NotLoggedIn => "error-not-logged-in",
        RequestError::Busy => "error-busy",
    }
}

async fn async_initialize(config: Config, config_path: PathBuf) -> anyhow::Result<AppInit> {
    let log_manager =
        initialize_logger(&config.logging).context("failed to initialize logging")?;

    let warning = match check_helper(&config.advanced).await {
        Ok(check) if check.is_available() => {
            tracing::info!(
                "stream helper {} ({})",
                check.display_name(),
                check.version.as_deref().unwrap_or("unknown version")
            );
            None
        }
        Ok(check) => {
            tracing::warn!(
                "stream helper {} unavailable: {}",
                check.display_name(),
                check.problem.as_deref().unwrap_or("unknown")
            );
            Some(check.display_name())
        }
        Err(err) => {
            tracing::warn!("stream helper check failed: {err}");
            Some(config.advanced.helper_path.to_string_lossy().to_string())
        }
    }
    .map(|helper| {
        Localizer::new(&config.general.language)
            .text_with("warning-helper-missing", &[("helper", helper.into())])
    });

    let store = CredentialStore::new(config.credentials_path());
    let saved = match store.load() {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!("ignoring stored credentials: {err}");
            None
        }
    };
    let sessions = SessionCell::new(saved);

    let collaborators = Collaborators::from_config(&config);
    let service = Arc::new(DownloadService::new(
        config.clone(),
        sessions.clone(),
        collaborators,
    ));

    let authenticator = Arc::new(PkceAuthenticator::new(&config.auth));
    let reauth = ReauthFlow::new(
        authenticator,
        sessions,
        Duration::from_secs(config.auth.timeout_sec),
    )
    .with_store(store);

    Ok(AppInit {
        service,
        reauth,
        config,
        config_path,
        log_manager,
        warning,
    })
}

fn initialize_logger(settings: &LogSettings) -> std::io::Result<Option<LogManager>> {
    if !settings.enabled {
        return Ok(None);
    }

    let manager = LogManagerBuilder::default()
        .with_settings(settings)
        .stdout(false)
        .build()?;
    if let Some(dir) = manager.file_dir() {
        tracing::info!("logging at {} to {}", manager.level(), dir.display());
    }

    Ok(Some(manager))
}

fn open_in_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("rundll32")
            .arg("url.dll,FileProtocolHandler")
            .arg(url)
            .spawn()?;
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }

    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }

    Ok(())
}
