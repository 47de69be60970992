pub mod bus;
pub mod joined;

// Публичный экспорт всех типов ошибок, чтобы упростить доступ к ним из
// внешнего кода.
pub use bus::*;
pub use joined::*;
