use crate::registry::Registry;

/// Печатает таблицу регистрации: `<kind>\t<name>`.
pub fn run() {
    for (kind, name) in Registry::builtin().entries() {
        println!("{kind:<10}{name}");
    }
}
