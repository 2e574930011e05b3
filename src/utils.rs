use indicatif::{ProgressBar, ProgressStyle};

/// Create a progress bar with the given length and label, or a hidden one
pub fn create_progress_bar(len: u64, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    let template = format!(
        "{{spinner:.green}} [{}] [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}})",
        label
    );
    match ProgressStyle::default_bar().template(&template) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => log::debug!("Invalid progress template: {}", e),
    }
    pb
}

/// File stem for an asset, safe to use inside an archive
pub fn file_stem(external_id: &str) -> String {
    let sanitized = sanitize_filename::sanitize(external_id);
    if sanitized.is_empty() {
        "asset".to_string()
    } else {
        sanitized
    }
}

/// Stem of one video frame, zero-padded to the width of the frame count
pub fn frame_stem(stem: &str, frame_index: usize, frame_count: usize) -> String {
    let width = frame_count.to_string().len();
    format!("{}_{:0width$}", stem, frame_index + 1, width = width)
}

/// Six-decimal fixed-point rendering with trailing zeros trimmed
pub fn format_coordinate(value: f64) -> String {
    let formatted = format!("{:.6}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}
