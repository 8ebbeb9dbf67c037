// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_STATE_DIR: &str = "/var/lib/stowage";

fn state_dir_arg() -> Arg {
    Arg::new("state_dir")
        .short('s')
        .long("state-dir")
        .value_name("PATH")
        .default_value(DEFAULT_STATE_DIR)
        .global(true)
        .help("State directory holding the artifact record and module registry")
}

fn build_cli() -> Command {
    Command::new("stowage")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Stowage Contributors")
        .about("Versioned module installer with checksum idempotence and rollback")
        .subcommand_required(false)
        .arg(state_dir_arg())
        .arg(
            Arg::new("persist_allow")
                .long("persist-allow")
                .value_name("REGEX")
                .global(true)
                .help("Symbolic names that are always persisted"),
        )
        .arg(
            Arg::new("persist_deny")
                .long("persist-deny")
                .value_name("REGEX")
                .global(true)
                .help("Symbolic names that are not persisted unless allowed"),
        )
        .subcommand(Command::new("init").about("Initialize the state directory"))
        .subcommand(
            Command::new("install")
                .about("Install a module archive from a file, a URL or the registry")
                .arg(Arg::new("source").help("Archive path or URL"))
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .help("Symbolic name the archive must carry"),
                )
                .arg(
                    Arg::new("module_version")
                        .long("module-version")
                        .help("Version the archive must carry"),
                )
                .arg(
                    Arg::new("url")
                        .short('u')
                        .long("url")
                        .help("URL to record for an archive read from a local file"),
                )
                .arg(
                    Arg::new("location")
                        .short('l')
                        .long("location")
                        .help("Registry location of an installed module"),
                )
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Replace non-snapshot versions and shadow other modules' items"),
                )
                .arg(
                    Arg::new("no_start")
                        .long("no-start")
                        .action(ArgAction::SetTrue)
                        .help("Do not start the module"),
                )
                .arg(
                    Arg::new("no_items")
                        .long("no-items")
                        .action(ArgAction::SetTrue)
                        .help("Do not load declared items"),
                )
                .arg(
                    Arg::new("no_validate")
                        .long("no-validate")
                        .action(ArgAction::SetTrue)
                        .help("Accept declared items without validating them"),
                ),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Stop managing a module and remove it")
                .arg(Arg::new("name").required(true).help("Symbolic name"))
                .arg(Arg::new("version").required(true).help("Module version")),
        )
        .subcommand(Command::new("list").about("List managed artifacts"))
        .subcommand(Command::new("history").about("Show install journal"))
        .subcommand(
            Command::new("checksum")
                .about("Print the content checksum of an archive")
                .arg(Arg::new("path").required(true).help("Archive path")),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("stowage.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
