use std::{
    error::Error,
    io::{self, Write},
    process::ExitCode,
    sync::{Arc, atomic::AtomicBool},
};

use crossterm::tty::IsTty;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stackctl::{
    cli::{Cli, Commands, DbCommands, DbUpArgs, PortCommands, parse_args},
    config::ServiceName,
    controller::LifecycleController,
    database::DatabaseInstanceConfig,
    foreground::install_interrupt_handler,
    ports::ConflictResolution,
    runtime::RuntimePaths,
    status::{StatusReport, render_json, render_text},
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let paths = match &args.root {
        Some(root) => RuntimePaths::from_root(root),
        None => RuntimePaths::discover()?,
    };
    paths.ensure_layout()?;
    let mut controller = LifecycleController::load(paths)?;

    match args.command {
        Commands::Start { service } => {
            match service {
                Some(service) => controller.start_managed_service(service)?,
                None => controller.start_all()?,
            }
            print_running(&controller, service)?;
        }
        Commands::Stop { service } => match service {
            Some(service) => {
                controller.stop_managed_service(service)?;
                println!("{service} stopped");
            }
            None => {
                controller.stop_all()?;
                println!("All services stopped");
            }
        },
        Commands::Down => {
            controller.down_all()?;
            println!("All services down");
        }
        Commands::Restart { service } => {
            match service {
                Some(service) => controller.restart_managed_service(service)?,
                None => controller.restart_all()?,
            }
            print_running(&controller, service)?;
        }
        Commands::Status {
            service,
            json,
            no_color,
        } => {
            let services = selected(service);
            let report = controller.status(&services)?;
            print_report(&report, json, no_color)?;
        }
        Commands::Logs {
            service,
            lines,
            follow,
        } => {
            let stop = Arc::new(AtomicBool::new(false));
            if follow {
                install_interrupt_handler(Arc::clone(&stop));
            }
            let mut stdout = io::stdout().lock();
            controller.logs(service, lines, follow, &stop, &mut stdout)?;
        }
        Commands::Run { service } => {
            let cancel = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(Arc::clone(&cancel));
            let exit = controller.run_foreground(service, cancel, io::stdout())?;
            if exit.cancelled {
                info!("{service} stopped");
                return Ok(ExitCode::SUCCESS);
            }
            return Ok(match exit.code {
                Some(0) => ExitCode::SUCCESS,
                Some(code) => {
                    warn!("{service} exited with code {code}");
                    ExitCode::from(u8::try_from(code).unwrap_or(1))
                }
                None => ExitCode::FAILURE,
            });
        }
        Commands::Db(DbCommands::Up(args)) => {
            let db = database_from_args(args);
            let (name, port) = (db.container_name(), db.host_port());
            controller.provision_database(db)?;
            println!("{name} listening on port {port}");
        }
        Commands::Db(DbCommands::Down { role }) => {
            controller.deprovision_database(role)?;
            println!("{role} database removed (data volume kept)");
        }
        Commands::Db(DbCommands::Status { json }) => {
            let report = StatusReport {
                mode: controller.mode(),
                services: Vec::new(),
                databases: controller.database_status()?,
            };
            if report.databases.is_empty() && !json {
                println!("No databases configured");
            } else {
                print_report(&report, json, false)?;
            }
        }
        Commands::Port(PortCommands::Check { port }) => {
            if controller.check_port(port) {
                println!("Port {port} is available");
            } else {
                println!("Port {port} is in use");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Port(PortCommands::Free { port }) => match controller.free_port(port)? {
            ConflictResolution::AlreadyFree => println!("Port {port} is already free"),
            ConflictResolution::Freed { pids } => {
                println!("Port {port} freed (stopped {})", join_pids(&pids));
            }
            ConflictResolution::StillBusy { pids } => {
                println!("Port {port} is still held by {}", join_pids(&pids));
                return Ok(ExitCode::FAILURE);
            }
            ConflictResolution::Undetermined => {
                println!("Port {port} is in use but its owner could not be determined");
                return Ok(ExitCode::FAILURE);
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn selected(service: Option<ServiceName>) -> Vec<ServiceName> {
    match service {
        Some(service) => vec![service],
        None => ServiceName::START_ORDER.to_vec(),
    }
}

fn print_running(
    controller: &LifecycleController,
    service: Option<ServiceName>,
) -> Result<(), Box<dyn Error>> {
    for service in selected(service) {
        let port = controller.config().ports.port_for(service);
        match controller.service_running(service)? {
            (true, Some(pid), _) => println!("{service} running (PID {pid}, port {port})"),
            (true, None, _) => println!("{service} running (port {port})"),
            (false, _, Some(log)) => {
                println!("{service} is not running; see {}", log.display());
            }
            (false, _, None) => println!("{service} is not running"),
        }
    }
    Ok(())
}

fn print_report(report: &StatusReport, json: bool, no_color: bool) -> Result<(), Box<dyn Error>> {
    let mut stdout = io::stdout();
    if json {
        writeln!(stdout, "{}", render_json(report)?)?;
    } else {
        let color = !no_color && stdout.is_tty();
        write!(stdout, "{}", render_text(report, color))?;
    }
    stdout.flush()?;
    Ok(())
}

fn database_from_args(args: DbUpArgs) -> DatabaseInstanceConfig {
    let mut db = DatabaseInstanceConfig::new(args.engine, args.role);
    if let Some(user) = args.user {
        db.user = user;
    }
    if let Some(password) = args.password {
        db.password = password;
    }
    if let Some(database) = args.database {
        db.database = database;
    }
    db
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
