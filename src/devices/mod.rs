//! Complex modules with business logic related to the problem
//! domain, that lay on top of abstract flash regions. Everything here is
//! generic; concrete flash drivers live with the board support code.

pub mod image;
pub mod swap;
