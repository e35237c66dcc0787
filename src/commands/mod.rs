//! 宿主程序调用的命令
//!
//! 每个函数对应一个请求/响应操作，参数中的 `category + relative_path`
//! 都会先经过路径解析器校验，不接受调用方传入的完整文件系统路径。

pub mod cache;
pub mod job;
pub mod log;
pub mod scan;
