use std::path::Path;

use crate::commands::common::{format_dead_letter_lines, open_operator, parse_owner, print_json};
use crate::error::CliError;

pub async fn run_dead_letters(owner: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let owner = parse_owner(owner)?;
    let (operator, _) = open_operator(db_path)?;
    let dead_letters = operator.dead_letters(&owner).await?;

    if as_json {
        return print_json(&dead_letters);
    }

    if dead_letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    for line in format_dead_letter_lines(&dead_letters) {
        println!("{line}");
    }
    Ok(())
}
