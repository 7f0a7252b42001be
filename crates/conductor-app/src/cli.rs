use conductor_protocol::error::{ConductorError, ConductorResult};
use conductor_protocol::ids::{ProfileId, ProjectId};
use conductor_protocol::session::{SessionCommand, SessionDate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run {
        project_id: ProjectId,
        command: SessionCommand,
        profile_id: Option<ProfileId>,
    },
    Dates {
        project_id: ProjectId,
    },
    Sessions {
        project_id: ProjectId,
        date: SessionDate,
    },
    Restore {
        project_id: ProjectId,
        date: SessionDate,
    },
    Clear {
        project_id: ProjectId,
        confirmed: bool,
    },
    Profiles,
    Help,
}

#[derive(Debug, Default)]
struct CliFlags {
    project_id: Option<ProjectId>,
    date: Option<SessionDate>,
    profile_id: Option<ProfileId>,
    workdir: Option<String>,
    confirmed: bool,
    positional: Vec<String>,
}

pub fn parse_cli_args(args: impl IntoIterator<Item = String>) -> ConductorResult<CliCommand> {
    let mut args = args.into_iter();
    let Some(subcommand) = args.next() else {
        return Ok(CliCommand::Help);
    };
    if matches!(subcommand.as_str(), "--help" | "-h" | "help") {
        return Ok(CliCommand::Help);
    }

    let mut flags = CliFlags::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--project" => {
                flags.project_id = Some(ProjectId::new(read_cli_value(&arg, args.next())?));
            }
            "--date" => {
                flags.date = Some(read_cli_value(&arg, args.next())?.parse()?);
            }
            "--profile" => {
                flags.profile_id = Some(ProfileId::new(read_cli_value(&arg, args.next())?));
            }
            "--cwd" => {
                flags.workdir = Some(read_cli_value(&arg, args.next())?);
            }
            "--yes" => flags.confirmed = true,
            "--" => {
                flags.positional.extend(args.by_ref());
            }
            "--help" | "-h" => return Ok(CliCommand::Help),
            value if value.starts_with("--") && flags.positional.is_empty() => {
                return Err(ConductorError::Configuration(format!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                )));
            }
            _ => flags.positional.push(arg),
        }
    }

    match subcommand.as_str() {
        "run" => {
            let mut positional = std::mem::take(&mut flags.positional).into_iter();
            let program = positional.next().ok_or_else(|| {
                ConductorError::Configuration(
                    "Missing program. Use: conductor run <program> [args...] --project <id>"
                        .to_owned(),
                )
            })?;
            let mut command = SessionCommand::new(program).args(positional);
            if let Some(workdir) = flags.workdir.take() {
                command = command.workdir(workdir);
            }
            Ok(CliCommand::Run {
                project_id: require_project(&mut flags)?,
                command,
                profile_id: flags.profile_id.take(),
            })
        }
        "dates" => {
            reject_positional(&flags)?;
            Ok(CliCommand::Dates {
                project_id: require_project(&mut flags)?,
            })
        }
        "sessions" => {
            reject_positional(&flags)?;
            Ok(CliCommand::Sessions {
                project_id: require_project(&mut flags)?,
                date: require_date(&mut flags)?,
            })
        }
        "restore" => {
            reject_positional(&flags)?;
            Ok(CliCommand::Restore {
                project_id: require_project(&mut flags)?,
                date: require_date(&mut flags)?,
            })
        }
        "clear" => {
            reject_positional(&flags)?;
            Ok(CliCommand::Clear {
                project_id: require_project(&mut flags)?,
                confirmed: flags.confirmed,
            })
        }
        "profiles" => {
            reject_positional(&flags)?;
            Ok(CliCommand::Profiles)
        }
        unknown => Err(ConductorError::Configuration(format!(
            "Unknown command '{unknown}'. Run with --help for valid commands."
        ))),
    }
}

pub fn print_cli_help() {
    println!("Usage: conductor <command> [flags]");
    println!();
    println!("  run <program> [args...] --project <id> [--profile <id>] [--cwd <dir>]");
    println!("                                    Start a session and attach it to this terminal");
    println!("  dates --project <id>              List dates with saved sessions");
    println!("  sessions --project <id> --date <YYYY-MM-DD>");
    println!("                                    List saved sessions of one date");
    println!("  restore --project <id> --date <YYYY-MM-DD>");
    println!("                                    Restart the saved sessions of one date");
    println!("  clear --project <id> --yes        Delete every saved session of a project");
    println!("  profiles                          List configured credential profiles");
    println!();
    println!("Arguments after '--' are passed to the program unchanged.");
}

fn read_cli_value(flag: &str, value: Option<String>) -> ConductorResult<String> {
    let value = value
        .map(|value| value.trim().to_owned())
        .unwrap_or_default();
    if value.is_empty() {
        return Err(ConductorError::Configuration(format!(
            "Missing value after {flag}."
        )));
    }
    Ok(value)
}

fn require_project(flags: &mut CliFlags) -> ConductorResult<ProjectId> {
    flags
        .project_id
        .take()
        .ok_or_else(|| ConductorError::Configuration("Missing --project <id>.".to_owned()))
}

fn require_date(flags: &mut CliFlags) -> ConductorResult<SessionDate> {
    flags
        .date
        .take()
        .ok_or_else(|| ConductorError::Configuration("Missing --date <YYYY-MM-DD>.".to_owned()))
}

fn reject_positional(flags: &CliFlags) -> ConductorResult<()> {
    match flags.positional.first() {
        Some(unexpected) => Err(ConductorError::Configuration(format!(
            "Unexpected argument '{unexpected}'. Run with --help for valid flags."
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ConductorResult<CliCommand> {
        parse_cli_args(args.iter().map(|arg| (*arg).to_owned()))
    }

    #[test]
    fn run_collects_program_arguments_and_flags() {
        let command = parse(&[
            "run", "claude", "--project", "proj", "--profile", "work", "--", "--resume", "-p",
        ])
        .expect("parse run");

        assert_eq!(
            command,
            CliCommand::Run {
                project_id: ProjectId::new("proj"),
                command: SessionCommand::new("claude").args(["--resume", "-p"]),
                profile_id: Some(ProfileId::new("work")),
            }
        );
    }

    #[test]
    fn flags_after_the_program_belong_to_the_program() {
        let command = parse(&["run", "--project", "proj", "claude", "--resume"]).expect("parse");

        let CliCommand::Run { command, .. } = command else {
            panic!("expected run");
        };
        assert_eq!(command.args, vec!["--resume".to_owned()]);
    }

    #[test]
    fn sessions_requires_a_valid_date() {
        let command = parse(&["sessions", "--project", "proj", "--date", "2024-03-09"])
            .expect("parse sessions");
        assert!(matches!(command, CliCommand::Sessions { date, .. } if date.to_string() == "2024-03-09"));

        assert!(parse(&["sessions", "--project", "proj"]).is_err());
        assert!(parse(&["sessions", "--project", "proj", "--date", "2024-13-01"]).is_err());
    }

    #[test]
    fn unknown_input_is_rejected() {
        assert!(matches!(
            parse(&["dates", "--verbose"]),
            Err(ConductorError::Configuration(_))
        ));
        assert!(parse(&["launch"]).is_err());
        assert!(parse(&["dates", "--project", "proj", "extra"]).is_err());
        assert!(parse(&["run", "--project", "proj"]).is_err());
    }

    #[test]
    fn help_and_clear_confirmation() {
        assert_eq!(parse(&[]).expect("empty"), CliCommand::Help);
        assert_eq!(parse(&["--help"]).expect("help"), CliCommand::Help);
        assert_eq!(
            parse(&["clear", "--project", "proj"]).expect("clear"),
            CliCommand::Clear {
                project_id: ProjectId::new("proj"),
                confirmed: false,
            }
        );
    }
}
