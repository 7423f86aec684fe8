pub mod cron;
pub mod evaluate;
pub mod window;
