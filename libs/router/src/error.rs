/// Ошибки сборки маршрутов.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("producer '{0}' registered twice")]
    DuplicateProducer(String),

    #[error("producer '{0}' is not subscribed to any stream")]
    NoStreams(String),
}
