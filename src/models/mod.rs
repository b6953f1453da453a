pub mod assignment;
pub mod catalog;
pub mod courier;
pub mod notification;
pub mod order;
pub mod otp;
