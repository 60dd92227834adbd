//! Inspect command.
//!
//! Works purely on the reference string (offline).

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use stevedore_reference::ImageReference;

use crate::output::{print_field, print_json, OutputFormat};

use super::CommandContext;

/// Parse an image reference.
#[derive(Debug, Args)]
pub struct InspectCommand {
    /// Image reference, e.g. `ghcr.io/org/app:1.0`.
    #[arg(value_name = "REF")]
    reference: String,
}

/// Components of a parsed reference.
#[derive(Debug, Serialize)]
struct ReferenceView<'a> {
    name: String,
    registry: &'a str,
    repository: &'a str,
    tag: Option<&'a str>,
    digest: Option<&'a str>,
    reference: &'a str,
    docker_hub: bool,
}

impl<'a> ReferenceView<'a> {
    fn new(reference: &'a ImageReference) -> Self {
        Self {
            name: reference.to_string_with_tag(),
            registry: reference.registry(),
            repository: reference.repository(),
            tag: reference.tag(),
            digest: reference.digest(),
            reference: reference.reference(),
            docker_hub: reference.is_docker_hub(),
        }
    }
}

impl InspectCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let reference = ImageReference::parse(&self.reference)?;
        let view = ReferenceView::new(&reference);

        match ctx.format {
            OutputFormat::Json => print_json(&view),
            OutputFormat::Text => {
                println!("{}", view.name);
                print_field("registry", view.registry);
                print_field("repository", view.repository);
                print_field("tag", view.tag.unwrap_or("-"));
                print_field("digest", view.digest.unwrap_or("-"));
            }
        }

        Ok(())
    }
}
