use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use rollcall_core::{NearestNeighborModel, ScrfdDetector};
use rollcall_engine::ledger::TIME_FORMAT;
use rollcall_engine::{
    capture_sample, train_and_save, AttendanceLedger, CaptureOutcome, Config, EnrollmentStore,
    Overlay, Presenter, RecognitionEngine, StopReason,
};
use rollcall_hw::Camera;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Camera-based attendance: enroll, train, recognize")]
struct Cli {
    /// TOML config file (overrides ROLLCALL_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one face sample for a person
    Enroll {
        /// Identity label (e.g., "alice")
        #[arg(short, long)]
        name: String,
    },
    /// Rebuild the recognition model from all enrolled samples
    Train,
    /// Recognize faces and mark attendance until Ctrl-C
    Recognize,
    /// List enrolled identities
    List,
    /// Print the attendance ledger
    Report,
    /// List V4L2 capture devices
    Devices,
    /// Interactive menu
    Menu,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let interrupt = Interrupt::default();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !interrupt.on_ctrl_c() {
                    std::process::exit(130);
                }
            }
        });
    }

    match cli.command {
        Commands::Enroll { name } => {
            blocking(config, interrupt, move |c, i| enroll(c, &name, i)).await
        }
        Commands::Train => blocking(config, interrupt, |c, _| train(c)).await,
        Commands::Recognize => blocking(config, interrupt, recognize).await,
        Commands::List => list(&config),
        Commands::Report => report(&config),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({})", d.path, d.name, d.driver);
            }
            Ok(())
        }
        Commands::Menu => blocking(config, interrupt, menu).await,
    }
}

/// Ctrl-C state shared between the signal task and blocking work.
///
/// While a capture or recognition session runs, the first Ctrl-C asks it to
/// stop. Anywhere else, or on a second Ctrl-C, the process exits.
#[derive(Clone, Default)]
struct Interrupt {
    stop: Arc<AtomicBool>,
    session: Arc<AtomicBool>,
}

impl Interrupt {
    /// Returns `false` when the process should exit.
    fn on_ctrl_c(&self) -> bool {
        if !self.session.load(Ordering::SeqCst) {
            return false;
        }
        if self.stop.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!("interrupt received; stopping session");
        true
    }

    /// Mark a cancellable session as running until the guard drops.
    fn session(&self) -> SessionGuard<'_> {
        self.stop.store(false, Ordering::SeqCst);
        self.session.store(true, Ordering::SeqCst);
        SessionGuard(self)
    }
}

struct SessionGuard<'a>(&'a Interrupt);

impl SessionGuard<'_> {
    fn stop_flag(&self) -> &AtomicBool {
        &self.0.stop
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.session.store(false, Ordering::SeqCst);
    }
}

/// Run camera and filesystem work off the async runtime.
async fn blocking<F>(config: Config, interrupt: Interrupt, f: F) -> Result<()>
where
    F: FnOnce(&Config, &Interrupt) -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&config, &interrupt)).await?
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    ScrfdDetector::load(&config.detector_model, config.detector_threshold)
        .with_context(|| format!("loading face detector {}", config.detector_model.display()))
}

fn open_camera(config: &Config) -> Result<Camera> {
    Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .with_context(|| format!("opening camera {}", config.camera_device))
}

fn enroll(config: &Config, name: &str, interrupt: &Interrupt) -> Result<()> {
    let store = EnrollmentStore::open(&config.dataset_dir)?;
    let mut detector = load_detector(config)?;
    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.discard(config.warmup_frames);

    println!("Capturing a sample for {name}. Look at the camera (Ctrl-C to cancel).");
    let session = interrupt.session();
    let outcome = capture_sample(&mut stream, &mut detector, &store, name, session.stop_flag())?;
    drop(session);
    match outcome {
        CaptureOutcome::Captured(sample) => {
            let count = store.sample_count(&sample.identity)?;
            println!(
                "Enrolled {} ({} sample(s)): {}",
                sample.identity,
                count,
                sample.path.display()
            );
            println!("Run `rollcall train` to include it in the model.");
        }
        CaptureOutcome::Aborted { frames } => {
            println!("Enrollment cancelled after {frames} frame(s); nothing stored.");
        }
    }
    Ok(())
}

fn train(config: &Config) -> Result<()> {
    let store = EnrollmentStore::open(&config.dataset_dir)?;
    let model = train_and_save(&store, &config.model_path)?;
    println!(
        "Trained on {} sample(s) of {} identit(ies); saved to {}",
        model.len(),
        model.identities().len(),
        config.model_path.display()
    );
    Ok(())
}

/// Logs labelled regions; the CLI has no display surface.
struct LogPresenter;

impl Presenter for LogPresenter {
    fn render(&mut self, _frame: &DynamicImage, overlays: &[Overlay]) {
        for overlay in overlays {
            tracing::debug!(label = %overlay.label, region = ?overlay.region, "overlay");
        }
    }
}

fn recognize(config: &Config, interrupt: &Interrupt) -> Result<()> {
    // Model and ledger first: a missing model should fail before the camera opens.
    let model = NearestNeighborModel::load(&config.model_path)?;
    let ledger = AttendanceLedger::load(&config.ledger_path)?;
    let detector = load_detector(config)?;
    let camera = open_camera(config)?;
    let mut stream = camera.stream()?;
    stream.discard(config.warmup_frames);

    println!("Recognizing. Press Ctrl-C to stop.");
    let mut engine =
        RecognitionEngine::new(model, ledger, stream, detector).with_presenter(LogPresenter);
    let session = interrupt.session();
    let summary = engine.run(session.stop_flag())?;
    drop(session);

    for event in &summary.marked {
        println!("{}  {}", event.time.format(TIME_FORMAT), event.identity);
    }
    println!(
        "{} frame(s), {} face(s), {} marked, {} ledger failure(s)",
        summary.frames,
        summary.faces,
        summary.marked.len(),
        summary.ledger_failures
    );
    if let StopReason::StreamEnded(reason) = &summary.reason {
        println!("Camera stream ended: {reason}");
    }
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let store = EnrollmentStore::open(&config.dataset_dir)?;
    let identities = store.list_identities()?;
    if identities.is_empty() {
        println!("No identities enrolled");
    }
    for identity in &identities {
        println!("{identity}  {} sample(s)", store.sample_count(identity)?);
    }

    match NearestNeighborModel::load(&config.model_path) {
        Ok(model) => println!(
            "Model: {} entries, {} identities, trained {}",
            model.len(),
            model.identities().len(),
            model.trained_at().format("%Y-%m-%d %H:%M:%S UTC")
        ),
        Err(e) => println!("Model: {e}"),
    }
    Ok(())
}

fn report(config: &Config) -> Result<()> {
    let ledger = AttendanceLedger::load(&config.ledger_path)?;
    if ledger.is_empty() {
        println!("No attendance recorded in {}", config.ledger_path.display());
        return Ok(());
    }
    for record in ledger.records() {
        println!("{}  {}", record.time.format(TIME_FORMAT), record.identity);
    }
    println!("{} present", ledger.len());
    Ok(())
}

fn menu(config: &Config, interrupt: &Interrupt) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        println!();
        println!("1. Enroll a new person");
        println!("2. Train the model");
        println!("3. Start attendance");
        println!("4. Exit");
        print!("Choice: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next() else {
            return Ok(());
        };

        let result = match line?.trim() {
            "1" => {
                print!("Name: ");
                std::io::stdout().flush()?;
                match lines.next() {
                    Some(name) => enroll(config, name?.trim(), interrupt),
                    None => return Ok(()),
                }
            }
            "2" => train(config),
            "3" => recognize(config, interrupt),
            "4" => return Ok(()),
            other => {
                println!("Unknown choice {other:?}");
                Ok(())
            }
        };

        if let Err(e) = result {
            eprintln!("Error: {e:#}");
        }
    }
}
