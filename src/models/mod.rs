pub mod city;
pub mod delay;
pub mod message;
pub mod route;
