use crate::models::ChangeRequest;
use std::path::Path;

/// Tags longer than this are shortened in commit subjects
pub const MAX_TAG_LENGTH: usize = 50;
const TAG_HEAD: usize = 35;
const TAG_TAIL: usize = 8;

/// Build the commit message for a repository pass, `None` when nothing changed.
///
/// A single change gets a readable subject (`values: app:develop-200`).
/// Several changes get `<git_message> [<count>]` and a body listing them.
pub fn commit_message(changes: &[ChangeRequest], git_message: &str) -> Option<String> {
    match changes {
        [] => None,
        [change] => Some(nicer_message(change)),
        _ => {
            let mut message = format!("{} [{}]\n", git_message, changes.len());
            for change in changes {
                message.push_str(&format!(
                    "\n- {}: {}:{} -> {}",
                    change.file.display(),
                    change.image,
                    change.old,
                    change.new
                ));
            }
            Some(message)
        },
    }
}

/// `<file stem>: <image basename>:<tag>` for a single change
pub fn nicer_message(change: &ChangeRequest) -> String {
    format!(
        "{}: {}:{}",
        file_stem(&change.file),
        image_basename(&change.image),
        truncate_tag(&change.new)
    )
}

/// Shorten tags over [`MAX_TAG_LENGTH`] characters to `first-35...last-8`
pub fn truncate_tag(tag: &str) -> String {
    let chars: Vec<char> = tag.chars().collect();
    if chars.len() <= MAX_TAG_LENGTH {
        return tag.to_string();
    }

    let head: String = chars[..TAG_HEAD].iter().collect();
    let tail: String = chars[chars.len() - TAG_TAIL..].iter().collect();
    format!("{}...{}", head, tail)
}

fn image_basename(image: &str) -> &str {
    image.rsplit('/').next().unwrap_or(image)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
