use std::error::Error;

use clap::{Parser, Subcommand};
use mcl::control::{ControlClient, DEFAULT_CONTROL_PORT, StatusRecord};

#[derive(Debug, Parser)]
#[command(version, about = "Run one command against a database managing daemon", long_about = None)]
struct Cli {
    /// Host the daemon runs on
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Control port of the daemon
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,
    /// Control passphrase
    #[arg(long)]
    passphrase: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the status of one or all databases
    Status { database: Option<String> },
    Start { database: String },
    Stop { database: String },
    Kill { database: String },
    Create { database: String },
    Destroy { database: String },
    /// Put a database in maintenance mode
    Lock { database: String },
    /// Take a database out of maintenance mode
    Release { database: String },
    Rename { database: String, new_name: String },
    /// Set a database property; an empty value restores the default
    Set {
        database: String,
        key: String,
        value: String,
    },
    /// List the properties of a database, or the defaults if none is given
    Get { database: Option<String> },
    /// List databases announced by neighbouring daemons
    Neighbours,
    Version,
}

fn print_status(record: &StatusRecord) {
    let locked = if record.locked { " (locked)" } else { "" };
    println!(
        "{}\t{}{locked}\t{}\t{}",
        record.name,
        record.state,
        record.scenarios.join(","),
        record.uri
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = ControlClient::new(cli.host, cli.port, cli.passphrase);

    match cli.command {
        Command::Status { database: Some(db) } => print_status(&client.get_status(&db)?),
        Command::Status { database: None } => {
            for record in client.get_all_statuses()? {
                print_status(&record);
            }
        }
        Command::Start { database } => client.start(&database)?,
        Command::Stop { database } => client.stop(&database)?,
        Command::Kill { database } => client.kill(&database)?,
        Command::Create { database } => client.create(&database)?,
        Command::Destroy { database } => client.destroy(&database)?,
        Command::Lock { database } => client.lock(&database)?,
        Command::Release { database } => client.release(&database)?,
        Command::Rename { database, new_name } => client.rename(&database, &new_name)?,
        Command::Set {
            database,
            key,
            value,
        } if value.is_empty() => client.inherit_property(&database, &key)?,
        Command::Set {
            database,
            key,
            value,
        } => client.set_property(&database, &key, &value)?,
        Command::Get { database } => {
            let props = match database {
                Some(db) => client.get_properties(&db)?,
                None => client.get_default_properties()?,
            };
            for (key, value) in props {
                println!("{key}={value}");
            }
        }
        Command::Neighbours => {
            for neighbour in client.get_all_neighbours()? {
                println!("{}", neighbour.location());
            }
        }
        Command::Version => println!("{}", client.version()?),
    }

    Ok(())
}
