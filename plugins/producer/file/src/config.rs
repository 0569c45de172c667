// ════════════════════════════════════════════════════════════════
//  Configuration
// ════════════════════════════════════════════════════════════════

#[derive(serde::Deserialize)]
pub(crate) struct FileProducerConfig {
    /// Активный файл; ротированные копии лежат рядом с ним.
    pub path: String,
    /// Ротация по размеру активного файла, мегабайты.
    #[serde(default)]
    pub rotate_size_mb: Option<u64>,
    /// Ротация по возрасту активного файла, секунды.
    #[serde(default)]
    pub rotate_age_sec: Option<u64>,
    /// Создавать недостающие каталоги.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,
}

fn default_create_dirs() -> bool {
    true
}
