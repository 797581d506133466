//! Terminal prompts for pages the readers could not resolve.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use image::ImageFormat;
use tracing::warn;

use crate::reconcile::{Decision, Prompt, Resolver};

const SKIP: &str = "s";
const ADD: &str = "add";

/// Asks on `output` and reads answers from `input`, one per line.
///
/// `s` skips the page, `add` adds the candidate person number to the
/// gradebook, anything else is taken as the value asked for. End of input
/// skips every remaining page.
pub struct ConsoleResolver<R, W> {
    input: R,
    output: W,
    preview: Option<PathBuf>,
}

impl<R: BufRead, W: Write> ConsoleResolver<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            preview: None,
        }
    }

    /// Save each prompted page as a PNG at `path` before asking about it.
    pub fn with_preview(mut self, path: impl Into<PathBuf>) -> Self {
        self.preview = Some(path.into());
        self
    }

    fn ask(&mut self, prompt: &Prompt<'_>) -> std::io::Result<Decision> {
        let origin = prompt.origin();
        writeln!(self.output)?;
        match prompt {
            Prompt::MissingCode { rejected, .. } => {
                writeln!(
                    self.output,
                    "{}, page {}: identity code not found.",
                    origin.source_file,
                    origin.page_index + 1
                )?;
                if let Some(value) = rejected {
                    writeln!(self.output, "{:?} is not a valid code for this exam.", value)?;
                }
            }
            Prompt::UnknownStudent {
                code, candidate, ..
            } => {
                writeln!(
                    self.output,
                    "{}, page {}: cover page {} has no matching person number.",
                    origin.source_file,
                    origin.page_index + 1,
                    code
                )?;
                if let Some(value) = candidate {
                    writeln!(self.output, "Read {:?}, which is not in the gradebook.", value)?;
                }
            }
        }
        self.show_preview(prompt);

        let question = match prompt {
            Prompt::MissingCode { .. } => "Enter the code (s to skip): ".to_string(),
            Prompt::UnknownStudent {
                candidate: Some(value),
                ..
            } => format!(
                "Enter the person number, '{}' to add {} to the gradebook, or {} to skip: ",
                ADD, value, SKIP
            ),
            Prompt::UnknownStudent { .. } => "Enter the person number (s to skip): ".to_string(),
        };

        loop {
            write!(self.output, "{}", question)?;
            self.output.flush()?;
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                writeln!(self.output)?;
                return Ok(Decision::Skip);
            }
            match line.trim() {
                "" => continue,
                SKIP => return Ok(Decision::Skip),
                ADD => return Ok(Decision::AddToRoster),
                value => return Ok(Decision::Provide(value.to_string())),
            }
        }
    }

    fn show_preview(&mut self, prompt: &Prompt<'_>) {
        let (Some(path), Some(image)) = (self.preview.as_ref(), prompt.image()) else {
            return;
        };
        match image.save_with_format(path, ImageFormat::Png) {
            Ok(()) => {
                let _ = writeln!(self.output, "Page image: {}", path.display());
            }
            Err(e) => warn!("Could not write page preview {:?}: {}", path, e),
        }
    }
}

impl<R: BufRead, W: Write> Resolver for ConsoleResolver<R, W> {
    fn resolve(&mut self, prompt: &Prompt<'_>) -> Decision {
        match self.ask(prompt) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Console prompt failed, skipping page: {}", e);
                Decision::Skip
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityCode;
    use crate::reconcile::PageOrigin;
    use image::{DynamicImage, GrayImage};
    use std::io::Cursor;

    fn origin() -> PageOrigin {
        PageOrigin {
            source_file: "batch1.pdf".to_string(),
            page_index: 2,
        }
    }

    fn resolver(input: &str) -> ConsoleResolver<Cursor<Vec<u8>>, Vec<u8>> {
        ConsoleResolver::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    fn missing_code(origin: &PageOrigin) -> Prompt<'_> {
        Prompt::MissingCode {
            origin,
            image: None,
            rejected: None,
        }
    }

    #[test]
    fn test_answers_map_to_decisions() {
        let origin = origin();
        let mut console = resolver("MTH309-C001-P02\ns\n\n\nadd\n");
        let prompt = missing_code(&origin);
        assert_eq!(
            console.resolve(&prompt),
            Decision::Provide("MTH309-C001-P02".to_string())
        );
        assert_eq!(console.resolve(&prompt), Decision::Skip);
        assert_eq!(console.resolve(&prompt), Decision::AddToRoster);
        assert_eq!(console.resolve(&prompt), Decision::Skip);
    }

    #[test]
    fn test_student_prompt_mentions_candidate() {
        let origin = origin();
        let code = IdentityCode::parse("MTH309-C001-P00").unwrap();
        let prompt = Prompt::UnknownStudent {
            origin: &origin,
            image: None,
            code: &code,
            candidate: Some("99999999".to_string()),
        };
        let mut console = resolver(" 12345678 \n");
        assert_eq!(console.resolve(&prompt), Decision::Provide("12345678".to_string()));

        let shown = String::from_utf8(console.output).unwrap();
        assert!(shown.contains("batch1.pdf, page 3: cover page MTH309-C001-P00"));
        assert!(shown.contains("'add' to add 99999999 to the gradebook"));
    }

    #[test]
    fn test_rejected_value_is_shown() {
        let origin = origin();
        let prompt = Prompt::MissingCode {
            origin: &origin,
            image: None,
            rejected: Some("C004-P03".to_string()),
        };
        let mut console = resolver("s\n");
        console.resolve(&prompt);
        let shown = String::from_utf8(console.output).unwrap();
        assert!(shown.contains("\"C004-P03\" is not a valid code"));
    }

    #[test]
    fn test_preview_written_for_page_image() {
        let dir = tempfile::tempdir().unwrap();
        let preview = dir.path().join("page.png");
        let origin = origin();
        let image = DynamicImage::ImageLuma8(GrayImage::new(8, 8));
        let prompt = Prompt::MissingCode {
            origin: &origin,
            image: Some(&image),
            rejected: None,
        };
        let mut console = resolver("s\n").with_preview(&preview);
        console.resolve(&prompt);
        assert!(preview.exists());
        assert!(String::from_utf8(console.output).unwrap().contains("page.png"));
    }
}
