//! Project initialization for repeat-predictor
//!
//! `repeat-predictor init` creates the project directory, a default config
//! and an empty call database.

use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, PROJECT_DIR};
use crate::db::{Database, DB_FILE};

const CONFIG_HEADER: &str = "# repeat-predictor configuration\n\
# Unset keys fall back to their defaults.\n\n";

/// Initialize repeat-predictor in `root`. Returns the database path.
pub fn init_project(root: &Path) -> Result<PathBuf, String> {
    println!("\n{}", "Initializing repeat-predictor...".cyan().bold());
    println!("   Directory: {}\n", root.display());

    // 1. Create the project directory
    let project_dir = root.join(PROJECT_DIR);
    announce(ensure_project_dir(&project_dir)?, PROJECT_DIR);

    // 2. Write the default config
    let config_path = project_dir.join("config.toml");
    let config = Config::default()
        .to_toml()
        .map_err(|e| format!("Could not render default config: {}", e))?;
    let outcome = ensure_file(&config_path, &format!("{}{}", CONFIG_HEADER, config))?;
    announce(outcome, &format!("{}/config.toml", PROJECT_DIR));

    // 3. Initialize database by opening it (creates tables)
    let db_path = project_dir.join(DB_FILE);
    let existed = db_path.exists();
    Database::open_at(&db_path).map_err(|e| format!("Could not create database: {}", e))?;
    let outcome = if existed { Outcome::Kept } else { Outcome::Created };
    announce(outcome, &format!("{}/{}", PROJECT_DIR, DB_FILE));

    // 4. Keep the local database out of version control
    add_to_gitignore(root)?;

    println!("\n{}", "repeat-predictor initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Load calls with {}", "repeat-predictor import calls.json".cyan());
    println!("  2. Predict with {}", "repeat-predictor run <username> <password>".cyan());
    println!("  3. Review with {}", "repeat-predictor predictions --date dd/mm/yyyy".cyan());
    println!();

    Ok(db_path)
}

/// What `init` did with one project file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Kept,
}

fn announce(outcome: Outcome, name: &str) {
    match outcome {
        Outcome::Created => println!("   {} {}", "Creating".green(), name),
        Outcome::Kept => println!("   {} {} (already exists)", "Skipping".yellow(), name),
    }
}

fn ensure_project_dir(dir: &Path) -> Result<Outcome, String> {
    if dir.is_dir() {
        return Ok(Outcome::Kept);
    }
    fs::create_dir_all(dir).map_err(|e| format!("Could not create {}: {}", dir.display(), e))?;
    Ok(Outcome::Created)
}

/// Write `contents` unless the user already has a file at `path`.
fn ensure_file(path: &Path, contents: &str) -> Result<Outcome, String> {
    if path.exists() {
        return Ok(Outcome::Kept);
    }
    fs::write(path, contents).map_err(|e| format!("Could not write {}: {}", path.display(), e))?;
    Ok(Outcome::Created)
}

fn add_to_gitignore(root: &Path) -> Result<(), String> {
    let gitignore_path = root.join(".gitignore");
    let entry = format!("{}/{}", PROJECT_DIR, DB_FILE);

    if gitignore_path.exists() {
        let existing = fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Could not read .gitignore: {}", e))?;

        if existing.lines().any(|line| line.trim() == entry || line.trim() == PROJECT_DIR) {
            return Ok(());
        }

        let new_content = format!(
            "{}\n\n# repeat-predictor database (local)\n{}\n",
            existing.trim_end(),
            entry
        );
        fs::write(&gitignore_path, new_content)
            .map_err(|e| format!("Could not update .gitignore: {}", e))?;
        println!("   {} .gitignore (added {})", "Updated".green(), entry);
    } else {
        let content = format!("# repeat-predictor database (local)\n{}\n", entry);
        fs::write(&gitignore_path, content)
            .map_err(|e| format!("Could not create .gitignore: {}", e))?;
        println!("   {} .gitignore", "Creating".green());
    }

    Ok(())
}
